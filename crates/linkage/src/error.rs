use std::fmt;

use serde::Serialize;

use crate::model::Side;

#[derive(Debug)]
pub enum LinkError {
    /// TOML parse / deserialization error.
    ConfigParse(String),
    /// Config validation error (unknown field, bad thresholds, etc.).
    ConfigValidation(String),
    /// Missing required column in input data.
    MissingColumn { source: String, column: String },
    /// Two records on the same side share an identifier.
    DuplicateRecordId { side: Side, record_id: String },
    /// Persisted parameters were fit under a different field schema.
    ConfigurationMismatch { expected: String, found: String },
    /// Two competing links compare equal under the full tiebreak chain.
    AmbiguousResolution { a_id: String, b_id: String, other_a_id: String, other_b_id: String },
    /// IO error (file read, CSV decode, etc.).
    Io(String),
    /// JSON encode/decode error.
    Serialization(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigParse(msg) => write!(f, "config parse error: {msg}"),
            Self::ConfigValidation(msg) => write!(f, "config validation error: {msg}"),
            Self::MissingColumn { source, column } => {
                write!(f, "source '{source}': missing column '{column}'")
            }
            Self::DuplicateRecordId { side, record_id } => {
                write!(f, "set {side}: duplicate record id '{record_id}'")
            }
            Self::ConfigurationMismatch { expected, found } => write!(
                f,
                "configuration mismatch: model was fit for schema {found}, current schema is {expected}"
            ),
            Self::AmbiguousResolution { a_id, b_id, other_a_id, other_b_id } => write!(
                f,
                "ambiguous resolution: ({a_id}, {b_id}) and ({other_a_id}, {other_b_id}) tie after every tiebreak"
            ),
            Self::Io(msg) => write!(f, "IO error: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization error: {msg}"),
        }
    }
}

impl std::error::Error for LinkError {}

/// A raw value that cannot be coerced to its field's declared type.
///
/// Recovered locally: the normalizer stores `Missing` for the field and keeps
/// the record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldError {
    InvalidField { field: String, value: String, expected: &'static str },
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidField { field, value, expected } => {
                write!(f, "field '{field}': cannot parse '{value}' as {expected}")
            }
        }
    }
}

impl std::error::Error for FieldError {}

/// Non-fatal conditions surfaced in the run result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkWarning {
    /// A field value was unparseable and treated as missing.
    InvalidField { side: Side, record_id: String, field: String, value: String },
    /// The catch-all bucket produced more pairs than the configured cap.
    BlockingOverflow { cap: usize, dropped: usize },
    /// The estimator stopped before parameter changes fell below tolerance.
    NonConvergence { iterations: usize, last_delta: f64, reason: String },
}

impl fmt::Display for LinkWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidField { side, record_id, field, value } => write!(
                f,
                "set {side}, record '{record_id}': field '{field}' value '{value}' is invalid, treated as missing"
            ),
            Self::BlockingOverflow { cap, dropped } => write!(
                f,
                "catch-all bucket exceeded cap of {cap} pairs, dropped {dropped} candidate pair(s)"
            ),
            Self::NonConvergence { iterations, last_delta, reason } => write!(
                f,
                "estimator did not converge after {iterations} iteration(s) ({reason}, last delta {last_delta:.3e})"
            ),
        }
    }
}
