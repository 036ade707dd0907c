//! Tokenizer/normalizer: raw strings → canonical, comparable field values.
//!
//! An unparseable value never drops its record. The field is stored as
//! `Missing` and the failure is reported as a warning.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;

use crate::config::{FieldConfig, FieldType, LinkConfig};
use crate::error::{FieldError, LinkError, LinkWarning};
use crate::model::{FieldValue, RawRecord, Record, Side};

/// Records of one side after normalization, plus the values that failed to parse.
#[derive(Debug)]
pub struct NormalizedSet {
    pub records: Vec<Record>,
    pub warnings: Vec<LinkWarning>,
}

/// Canonicalize one raw value according to its field type.
pub fn normalize_value(
    raw: &str,
    field: &FieldConfig,
    missing_tokens: &[String],
) -> Result<FieldValue, FieldError> {
    let trimmed = raw.trim();
    if missing_tokens.iter().any(|t| t.eq_ignore_ascii_case(trimmed)) {
        return Ok(FieldValue::Missing);
    }

    match field.field_type {
        FieldType::String => {
            let text = canonical_text(trimmed);
            Ok(if text.is_empty() { FieldValue::Missing } else { FieldValue::Text(text) })
        }
        FieldType::Categorical => {
            let category = collapse_whitespace(&trimmed.to_lowercase());
            Ok(if category.is_empty() { FieldValue::Missing } else { FieldValue::Category(category) })
        }
        FieldType::Numeric => parse_number(trimmed, field).map(FieldValue::Number),
        FieldType::Date => parse_date(trimmed, field).map(FieldValue::Date),
    }
}

/// Normalize every raw record of one side against the configured schema.
pub fn normalize_records(
    side: Side,
    raws: &[RawRecord],
    config: &LinkConfig,
) -> Result<NormalizedSet, LinkError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(raws.len());
    let mut records = Vec::with_capacity(raws.len());
    let mut warnings = Vec::new();

    for raw in raws {
        if !seen.insert(raw.id.as_str()) {
            return Err(LinkError::DuplicateRecordId { side, record_id: raw.id.clone() });
        }

        let mut values = BTreeMap::new();
        for field in &config.fields {
            let value = match raw.fields.get(&field.name) {
                None => FieldValue::Missing,
                Some(text) => match normalize_value(text, field, &config.missing_tokens) {
                    Ok(v) => v,
                    Err(err) => {
                        log::debug!("set {side}, record '{}': {err}", raw.id);
                        warnings.push(LinkWarning::InvalidField {
                            side,
                            record_id: raw.id.clone(),
                            field: field.name.clone(),
                            value: text.clone(),
                        });
                        FieldValue::Missing
                    }
                },
            };
            values.insert(field.name.clone(), value);
        }
        records.push(Record::new(raw.id.clone(), side, values));
    }

    if !warnings.is_empty() {
        log::warn!(
            "set {side}: {} field value(s) could not be normalized and were treated as missing",
            warnings.len()
        );
    }

    Ok(NormalizedSet { records, warnings })
}

/// Lower-case, drop punctuation, treat `-`/`_` as spaces, collapse whitespace.
fn canonical_text(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                Some(c)
            } else if c == '-' || c == '_' {
                Some(' ')
            } else {
                None
            }
        })
        .collect();
    collapse_whitespace(&cleaned.to_lowercase())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_number(s: &str, field: &FieldConfig) -> Result<f64, FieldError> {
    let invalid = || FieldError::InvalidField {
        field: field.name.clone(),
        value: s.to_string(),
        expected: "number",
    };
    let digits: String = s.chars().filter(|c| *c != ',' && *c != '_').collect();
    let n: f64 = digits.parse().map_err(|_| invalid())?;
    if !n.is_finite() {
        return Err(invalid());
    }
    Ok(match field.precision {
        Some(p) => {
            let factor = 10f64.powi(p as i32);
            (n * factor).round() / factor
        }
        None => n,
    })
}

fn parse_date(s: &str, field: &FieldConfig) -> Result<NaiveDate, FieldError> {
    field
        .date_formats()
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .ok_or_else(|| FieldError::InvalidField {
            field: field.name.clone(),
            value: s.to_string(),
            expected: "date",
        })
}
