use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::block::BlockingStats;
use crate::error::LinkWarning;
use crate::estimate::EstimationReport;
use crate::evaluate::EvaluationSummary;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Which of the two record sets a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// A record as delivered by a source: stable id plus raw string values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl RawRecord {
    pub fn new<I, K, V>(id: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            id: id.into(),
            fields: fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Pre-loaded records for both sides, plus optional ground-truth links.
#[derive(Debug, Clone, Default)]
pub struct LinkInput {
    pub a: Vec<RawRecord>,
    pub b: Vec<RawRecord>,
    /// Known true `(a_id, b_id)` links, for precision/recall.
    pub truth: Option<Vec<(String, String)>>,
}

// ---------------------------------------------------------------------------
// Normalized records
// ---------------------------------------------------------------------------

/// A canonical field value. `Missing` never counts as agreement or disagreement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Category(String),
    Number(f64),
    Date(NaiveDate),
    Missing,
}

impl FieldValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Category(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical string form used in block keys and exact joins.
    pub fn render(&self) -> String {
        match self {
            Self::Text(s) | Self::Category(s) => s.clone(),
            Self::Number(n) => format!("{n}"),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::Missing => String::new(),
        }
    }

    /// Numeric view: numbers as-is, dates as days since 0001-01-01.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Date(d) => Some(chrono::Datelike::num_days_from_ce(d) as f64),
            _ => None,
        }
    }
}

/// An ingested record. Only the normalizer builds these; they are never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: String,
    side: Side,
    values: BTreeMap<String, FieldValue>,
}

impl Record {
    pub(crate) fn new(id: String, side: Side, values: BTreeMap<String, FieldValue>) -> Self {
        Self { id, side, values }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Value for a field; fields outside the schema read as `Missing`.
    pub fn value(&self, field: &str) -> &FieldValue {
        static MISSING: FieldValue = FieldValue::Missing;
        self.values.get(field).unwrap_or(&MISSING)
    }

    pub fn values(&self) -> &BTreeMap<String, FieldValue> {
        &self.values
    }
}

// ---------------------------------------------------------------------------
// Candidate pairs + comparison
// ---------------------------------------------------------------------------

/// Indices into the A and B record sets plus every block key the two share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePair {
    pub a: usize,
    pub b: usize,
    pub block_keys: Vec<String>,
}

/// One slot per compared field, in schema order. `None` marks an incomparable slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonVector {
    pub levels: Vec<Option<u8>>,
    pub similarities: Vec<Option<f64>>,
}

impl ComparisonVector {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Sum of `1 - similarity` over comparable fields.
    pub fn aggregate_distance(&self) -> f64 {
        self.similarities.iter().flatten().map(|s| 1.0 - s).sum()
    }
}

// ---------------------------------------------------------------------------
// Model parameters
// ---------------------------------------------------------------------------

/// Agreement-level distributions of one field under each hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDistribution {
    pub name: String,
    /// P(level | match)
    pub m: Vec<f64>,
    /// P(level | non-match)
    pub u: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Prior probability that a candidate pair is a match.
    pub prior: f64,
    pub fields: Vec<FieldDistribution>,
}

impl ModelParameters {
    /// Sum of absolute differences across prior and every m/u entry.
    pub fn distance(&self, other: &ModelParameters) -> f64 {
        let mut total = (self.prior - other.prior).abs();
        for (a, b) in self.fields.iter().zip(&other.fields) {
            total += a.m.iter().zip(&b.m).map(|(x, y)| (x - y).abs()).sum::<f64>();
            total += a.u.iter().zip(&b.u).map(|(x, y)| (x - y).abs()).sum::<f64>();
        }
        total
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkLabel {
    Match,
    Review,
    NonMatch,
}

impl std::fmt::Display for LinkLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Match => write!(f, "match"),
            Self::Review => write!(f, "review"),
            Self::NonMatch => write!(f, "non_match"),
        }
    }
}

/// A scored candidate pair. Decisions are index-aligned with the candidate list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkDecision {
    pub a_id: String,
    pub b_id: String,
    /// Natural log of P(vector | match) / P(vector | non-match).
    pub log_likelihood_ratio: f64,
    /// Same ratio in bits (log2), the conventional Fellegi-Sunter weight.
    pub match_weight: f64,
    pub posterior: f64,
    pub label: LinkLabel,
    /// Set when the resolver turned a link into a non-match.
    pub demoted: bool,
    pub aggregate_distance: f64,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Which rule of the tiebreak chain decided between two competing links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    HigherPosterior,
    LowerFieldDistance,
    RecordIdOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    /// How this cluster's link beat its first competitor, if it had any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tiebreak: Option<TieBreak>,
    pub competitors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterLink {
    pub a_id: String,
    pub b_id: String,
    pub posterior: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkCluster {
    pub cluster_id: usize,
    pub a_ids: Vec<String>,
    pub b_ids: Vec<String>,
    pub links: Vec<ClusterLink>,
    /// Lowest posterior among the cluster's links.
    pub posterior: f64,
    pub resolution: Resolution,
}

/// A link dropped during resolution because a stronger link claimed one of its records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictEntry {
    pub a_id: String,
    pub b_id: String,
    pub posterior: f64,
    pub contested_side: Side,
    pub contested_id: String,
    pub winner_a_id: String,
    pub winner_b_id: String,
    pub winner_posterior: f64,
    pub reason: TieBreak,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LinkMeta {
    pub config_name: String,
    pub engine_version: String,
    pub run_at: String,
    pub schema_fingerprint: String,
    pub records_a: usize,
    pub records_b: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkResult {
    pub meta: LinkMeta,
    pub blocking: BlockingStats,
    pub estimation: EstimationReport,
    pub model: ModelParameters,
    pub decisions: Vec<LinkDecision>,
    pub clusters: Vec<LinkCluster>,
    pub conflicts: Vec<ConflictEntry>,
    pub evaluation: EvaluationSummary,
    pub warnings: Vec<LinkWarning>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_reads_unknown_field_as_missing() {
        let mut values = BTreeMap::new();
        values.insert("name".to_string(), FieldValue::Text("ada".into()));
        let record = Record::new("1".into(), Side::A, values);
        assert_eq!(record.value("name").as_text(), Some("ada"));
        assert!(record.value("zipcode").is_missing());
    }

    #[test]
    fn date_numeric_view_is_day_count() {
        let d1 = FieldValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let d2 = FieldValue::Date(NaiveDate::from_ymd_opt(2024, 2, 28).unwrap());
        assert_eq!(d1.as_number().unwrap() - d2.as_number().unwrap(), 2.0);
    }

    #[test]
    fn aggregate_distance_skips_incomparable_slots() {
        let v = ComparisonVector {
            levels: vec![Some(2), None, Some(0)],
            similarities: vec![Some(0.9), None, Some(0.25)],
        };
        assert_eq!(v.len(), 3);
        assert!((v.aggregate_distance() - 0.85).abs() < 1e-12);
    }
}
