use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::LinkError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    pub name: String,
    /// Max candidate pairs produced by the catch-all bucket.
    #[serde(default = "default_catch_all_cap")]
    pub catch_all_cap: usize,
    /// Raw values treated as missing (compared case-insensitively after trim).
    #[serde(default = "default_missing_tokens")]
    pub missing_tokens: Vec<String>,
    #[serde(default)]
    pub sources: Option<SourcesConfig>,
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub blocking: Vec<BlockingRule>,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub classifier: Cutoffs,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

fn default_catch_all_cap() -> usize {
    1_000_000
}

fn default_missing_tokens() -> Vec<String> {
    ["", "na", "n/a", "null", "none"].iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Sources (used by the CLI loader; the engine never touches files)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    pub a: SourceConfig,
    pub b: SourceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub file: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Field name → CSV column, for sources whose headers differ from field names.
    #[serde(default)]
    pub columns: HashMap<String, String>,
}

fn default_id_column() -> String {
    "id".into()
}

impl SourceConfig {
    /// CSV column holding the given field.
    pub fn column_for<'a>(&'a self, field: &'a str) -> &'a str {
        self.columns.get(field).map(String::as_str).unwrap_or(field)
    }
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Date,
    Numeric,
    Categorical,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Date => write!(f, "date"),
            Self::Numeric => write!(f, "numeric"),
            Self::Categorical => write!(f, "categorical"),
        }
    }
}

/// Similarity metric for one field. Every metric yields a value in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metric {
    Exact,
    Levenshtein,
    JaroWinkler,
    /// Common-prefix length over the longer value's length.
    Prefix,
    /// `1 / (1 + d / scale)`
    AbsDiff {
        #[serde(default = "default_scale")]
        scale: f64,
    },
    /// `2^(-(max(d - offset, 0) / scale)^2)`
    Gauss {
        #[serde(default)]
        offset: f64,
        scale: f64,
    },
    /// `max(0, 1 - max(d - offset, 0) / (2 * scale))`
    Linear {
        #[serde(default)]
        offset: f64,
        scale: f64,
    },
}

fn default_scale() -> f64 {
    1.0
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Levenshtein => "levenshtein",
            Self::JaroWinkler => "jaro_winkler",
            Self::Prefix => "prefix",
            Self::AbsDiff { .. } => "abs_diff",
            Self::Gauss { .. } => "gauss",
            Self::Linear { .. } => "linear",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::AbsDiff { .. } | Self::Gauss { .. } | Self::Linear { .. })
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, Self::Levenshtein | Self::JaroWinkler | Self::Prefix)
    }

    /// Agreement thresholds used when a field does not set `levels`.
    pub fn default_levels(&self) -> Vec<f64> {
        match self {
            Self::Exact => vec![1.0],
            Self::Levenshtein | Self::JaroWinkler | Self::Prefix => vec![0.95, 0.85],
            Self::AbsDiff { .. } | Self::Gauss { .. } | Self::Linear { .. } => vec![1.0, 0.5],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Fields without a metric are carried for blocking only.
    #[serde(default)]
    pub metric: Option<Metric>,
    /// Descending similarity thresholds; K thresholds give K+1 agreement levels.
    #[serde(default)]
    pub levels: Option<Vec<f64>>,
    /// Decimal places kept for numeric fields.
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(default)]
    pub date_formats: Option<Vec<String>>,
}

impl FieldConfig {
    pub fn is_compared(&self) -> bool {
        self.metric.is_some()
    }

    /// Effective thresholds (explicit `levels` or the metric default).
    pub fn thresholds(&self) -> Vec<f64> {
        match (&self.levels, &self.metric) {
            (Some(levels), _) => levels.clone(),
            (None, Some(metric)) => metric.default_levels(),
            (None, None) => Vec::new(),
        }
    }

    /// Number of agreement levels, including "disagree".
    pub fn level_count(&self) -> usize {
        self.thresholds().len() + 1
    }

    pub fn date_formats(&self) -> Vec<String> {
        self.date_formats.clone().unwrap_or_else(|| {
            ["%Y-%m-%d", "%m/%d/%Y", "%d.%m.%Y", "%Y%m%d"].iter().map(|s| s.to_string()).collect()
        })
    }
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

/// One blocking rule: a conjunction of key parts. Rules are OR-ed together.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockingRule {
    pub name: String,
    pub parts: Vec<KeyPart>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "transform", rename_all = "snake_case")]
pub enum KeyPart {
    Exact { field: String },
    Initial { field: String },
    Prefix { field: String, length: usize },
    Soundex { field: String },
    /// Floor-division of a numeric value (dates use their year).
    Bucket { field: String, width: f64 },
}

impl KeyPart {
    pub fn field(&self) -> &str {
        match self {
            Self::Exact { field }
            | Self::Initial { field }
            | Self::Prefix { field, .. }
            | Self::Soundex { field }
            | Self::Bucket { field, .. } => field,
        }
    }
}

// ---------------------------------------------------------------------------
// Estimator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub max_iterations: usize,
    /// Convergence when the sum of absolute parameter changes drops below this.
    pub tolerance: f64,
    /// Conditional probabilities are kept inside [floor, 1 - floor].
    pub probability_floor: f64,
    pub initial_prior: Option<f64>,
    /// Wall-clock budget for the EM loop.
    pub max_duration_ms: Option<u64>,
    /// Comparison patterns per parallel E-step chunk.
    pub chunk_size: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            probability_floor: 1e-6,
            initial_prior: None,
            max_duration_ms: None,
            chunk_size: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoffScale {
    /// Cutoffs are posterior match probabilities in [0, 1].
    Posterior,
    /// Cutoffs are likelihood ratios (> 0), compared in log space.
    LikelihoodRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cutoffs {
    pub scale: CutoffScale,
    pub upper: f64,
    pub lower: f64,
}

impl Default for Cutoffs {
    fn default() -> Self {
        Self {
            scale: CutoffScale::Posterior,
            upper: 0.9,
            lower: 0.5,
        }
    }
}

impl Cutoffs {
    pub fn validate(&self) -> Result<(), LinkError> {
        if !self.upper.is_finite() || !self.lower.is_finite() {
            return Err(LinkError::ConfigValidation("cutoffs must be finite".into()));
        }
        if self.lower > self.upper {
            return Err(LinkError::ConfigValidation(format!(
                "lower cutoff {} exceeds upper cutoff {}",
                self.lower, self.upper
            )));
        }
        match self.scale {
            CutoffScale::Posterior => {
                if self.lower < 0.0 || self.upper > 1.0 {
                    return Err(LinkError::ConfigValidation(
                        "posterior cutoffs must lie in [0, 1]".into(),
                    ));
                }
            }
            CutoffScale::LikelihoodRatio => {
                if self.lower <= 0.0 {
                    return Err(LinkError::ConfigValidation(
                        "likelihood-ratio cutoffs must be positive".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resolver + Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    OneToOne,
    /// One-to-one, failing if a tie survives the whole tiebreak chain.
    StrictOneToOne,
    /// Keep every accepted link; clusters are connected components.
    ManyToMany,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub mode: ResolutionMode,
    /// Treat `review` decisions as eligible links.
    pub include_review: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mode: ResolutionMode::OneToOne,
            include_review: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub posterior_bins: usize,
    pub sweep_step: f64,
    /// Pairs at or below this posterior are left out of bin diagnostics.
    pub diagnostic_floor: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            posterior_bins: 10,
            sweep_step: 0.01,
            diagnostic_floor: 1e-6,
        }
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl LinkConfig {
    pub fn from_toml(input: &str) -> Result<Self, LinkError> {
        let config: LinkConfig =
            toml::from_str(input).map_err(|e| LinkError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn field(&self, name: &str) -> Option<&FieldConfig> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields with a metric, in schema order. This is the comparison vector layout.
    pub fn compared_fields(&self) -> Vec<&FieldConfig> {
        self.fields.iter().filter(|f| f.is_compared()).collect()
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.fields.is_empty() {
            return Err(LinkError::ConfigValidation("at least one field is required".into()));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(LinkError::ConfigValidation("field name must not be empty".into()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(LinkError::ConfigValidation(format!(
                    "duplicate field '{}'",
                    field.name
                )));
            }
            validate_field(field)?;
        }

        if self.compared_fields().is_empty() {
            return Err(LinkError::ConfigValidation(
                "at least one field needs a metric".into(),
            ));
        }

        let mut rule_names = HashSet::new();
        for rule in &self.blocking {
            if !rule_names.insert(rule.name.as_str()) {
                return Err(LinkError::ConfigValidation(format!(
                    "duplicate blocking rule '{}'",
                    rule.name
                )));
            }
            if rule.name.is_empty() || rule.name.contains(':') {
                return Err(LinkError::ConfigValidation(format!(
                    "blocking rule name '{}' must be non-empty and free of ':'",
                    rule.name
                )));
            }
            if rule.parts.is_empty() {
                return Err(LinkError::ConfigValidation(format!(
                    "blocking rule '{}' has no parts",
                    rule.name
                )));
            }
            for part in &rule.parts {
                let Some(field) = self.field(part.field()) else {
                    return Err(LinkError::ConfigValidation(format!(
                        "blocking rule '{}': unknown field '{}'",
                        rule.name,
                        part.field()
                    )));
                };
                match part {
                    KeyPart::Prefix { length, .. } if *length == 0 => {
                        return Err(LinkError::ConfigValidation(format!(
                            "blocking rule '{}': prefix length must be at least 1",
                            rule.name
                        )));
                    }
                    KeyPart::Bucket { width, .. } => {
                        if !(*width > 0.0) {
                            return Err(LinkError::ConfigValidation(format!(
                                "blocking rule '{}': bucket width must be positive",
                                rule.name
                            )));
                        }
                        if !matches!(field.field_type, FieldType::Numeric | FieldType::Date) {
                            return Err(LinkError::ConfigValidation(format!(
                                "blocking rule '{}': bucket needs a numeric or date field, '{}' is {}",
                                rule.name, field.name, field.field_type
                            )));
                        }
                    }
                    _ => {}
                }
            }
        }

        let est = &self.estimator;
        if est.max_iterations == 0 {
            return Err(LinkError::ConfigValidation("max_iterations must be at least 1".into()));
        }
        if !(est.tolerance > 0.0) {
            return Err(LinkError::ConfigValidation("tolerance must be positive".into()));
        }
        if !(est.probability_floor > 0.0 && est.probability_floor < 0.5) {
            return Err(LinkError::ConfigValidation(
                "probability_floor must lie in (0, 0.5)".into(),
            ));
        }
        if let Some(prior) = est.initial_prior {
            if !(prior > 0.0 && prior < 1.0) {
                return Err(LinkError::ConfigValidation(
                    "initial_prior must lie in (0, 1)".into(),
                ));
            }
        }
        if est.chunk_size == 0 {
            return Err(LinkError::ConfigValidation("chunk_size must be at least 1".into()));
        }

        self.classifier.validate()?;

        let eval = &self.evaluation;
        if eval.posterior_bins == 0 {
            return Err(LinkError::ConfigValidation("posterior_bins must be at least 1".into()));
        }
        if !(eval.sweep_step > 0.0 && eval.sweep_step <= 1.0) {
            return Err(LinkError::ConfigValidation("sweep_step must lie in (0, 1]".into()));
        }

        Ok(())
    }
}

fn validate_field(field: &FieldConfig) -> Result<(), LinkError> {
    let name = &field.name;
    let Some(metric) = &field.metric else {
        if field.levels.is_some() {
            return Err(LinkError::ConfigValidation(format!(
                "field '{name}': levels set without a metric"
            )));
        }
        return Ok(());
    };

    let textual = matches!(field.field_type, FieldType::String | FieldType::Categorical);
    if metric.is_textual() && !textual {
        return Err(LinkError::ConfigValidation(format!(
            "field '{name}': metric {} needs a string or categorical field, got {}",
            metric.name(),
            field.field_type
        )));
    }
    if metric.is_numeric() && textual {
        return Err(LinkError::ConfigValidation(format!(
            "field '{name}': metric {} needs a numeric or date field, got {}",
            metric.name(),
            field.field_type
        )));
    }

    match metric {
        Metric::AbsDiff { scale } | Metric::Gauss { scale, .. } | Metric::Linear { scale, .. }
            if !(*scale > 0.0) =>
        {
            return Err(LinkError::ConfigValidation(format!(
                "field '{name}': scale must be positive"
            )));
        }
        Metric::Gauss { offset, .. } | Metric::Linear { offset, .. } if !(*offset >= 0.0) => {
            return Err(LinkError::ConfigValidation(format!(
                "field '{name}': offset must be non-negative"
            )));
        }
        _ => {}
    }

    let thresholds = field.thresholds();
    if thresholds.is_empty() {
        return Err(LinkError::ConfigValidation(format!(
            "field '{name}': at least one level threshold is required"
        )));
    }
    if thresholds.len() > u8::MAX as usize - 1 {
        return Err(LinkError::ConfigValidation(format!(
            "field '{name}': too many level thresholds"
        )));
    }
    for t in &thresholds {
        if !(*t > 0.0 && *t <= 1.0) {
            return Err(LinkError::ConfigValidation(format!(
                "field '{name}': level threshold {t} outside (0, 1]"
            )));
        }
    }
    if thresholds.windows(2).any(|w| w[0] <= w[1]) {
        return Err(LinkError::ConfigValidation(format!(
            "field '{name}': level thresholds must be strictly descending"
        )));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const PEOPLE: &str = r#"
name = "People"

[sources.a]
file = "dataset_a.csv"

[sources.b]
file = "dataset_b.csv"
id_column = "person_id"

[sources.b.columns]
lastname = "surname"

[[fields]]
name = "firstname"
type = "string"
metric = { kind = "jaro_winkler" }

[[fields]]
name = "lastname"
type = "string"
metric = { kind = "jaro_winkler" }
levels = [1.0, 0.88]

[[fields]]
name = "birthyear"
type = "numeric"
metric = { kind = "gauss", scale = 2.0 }

[[fields]]
name = "zipcode"
type = "categorical"

[[blocking]]
name = "zip"
parts = [{ transform = "exact", field = "zipcode" }]

[[blocking]]
name = "sdx"
parts = [
  { transform = "soundex", field = "lastname" },
  { transform = "bucket", field = "birthyear", width = 5.0 },
]

[estimator]
max_iterations = 50

[classifier]
upper = 0.95
lower = 0.2
"#;

    #[test]
    fn parse_valid_config() {
        let config = LinkConfig::from_toml(PEOPLE).unwrap();
        assert_eq!(config.name, "People");
        assert_eq!(config.fields.len(), 4);
        assert_eq!(config.compared_fields().len(), 3);
        assert_eq!(config.blocking.len(), 2);
        assert_eq!(config.catch_all_cap, 1_000_000);
        assert_eq!(config.estimator.max_iterations, 50);
        assert_eq!(config.estimator.tolerance, 1e-6);
        assert_eq!(config.classifier.upper, 0.95);
        assert_eq!(config.classifier.scale, CutoffScale::Posterior);
        assert_eq!(config.resolver.mode, ResolutionMode::OneToOne);

        let sources = config.sources.as_ref().unwrap();
        assert_eq!(sources.a.id_column, "id");
        assert_eq!(sources.b.id_column, "person_id");
        assert_eq!(sources.b.column_for("lastname"), "surname");
        assert_eq!(sources.b.column_for("firstname"), "firstname");
    }

    #[test]
    fn levels_default_from_metric() {
        let config = LinkConfig::from_toml(PEOPLE).unwrap();
        let first = config.field("firstname").unwrap();
        assert_eq!(first.thresholds(), vec![0.95, 0.85]);
        assert_eq!(first.level_count(), 3);
        let last = config.field("lastname").unwrap();
        assert_eq!(last.thresholds(), vec![1.0, 0.88]);
        let zip = config.field("zipcode").unwrap();
        assert!(!zip.is_compared());
    }

    #[test]
    fn blocking_parts_parse() {
        let config = LinkConfig::from_toml(PEOPLE).unwrap();
        assert_eq!(
            config.blocking[1].parts[1],
            KeyPart::Bucket { field: "birthyear".into(), width: 5.0 }
        );
    }

    fn with_fields(fields: &str) -> String {
        format!("name = \"t\"\n{fields}")
    }

    #[test]
    fn reject_text_metric_on_numeric_field() {
        let input = with_fields(
            r#"
[[fields]]
name = "birthyear"
type = "numeric"
metric = { kind = "levenshtein" }
"#,
        );
        let err = LinkConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("needs a string or categorical field"));
    }

    #[test]
    fn reject_ascending_levels() {
        let input = with_fields(
            r#"
[[fields]]
name = "name"
type = "string"
metric = { kind = "levenshtein" }
levels = [0.8, 0.9]
"#,
        );
        let err = LinkConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("strictly descending"));
    }

    #[test]
    fn reject_unknown_blocking_field() {
        let input = with_fields(
            r#"
[[fields]]
name = "name"
type = "string"
metric = { kind = "exact" }

[[blocking]]
name = "zip"
parts = [{ transform = "exact", field = "zipcode" }]
"#,
        );
        let err = LinkConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("'zipcode'"));
    }

    #[test]
    fn reject_colon_in_blocking_rule_name() {
        let input = with_fields(
            r#"
[[fields]]
name = "name"
type = "string"
metric = { kind = "exact" }

[[blocking]]
name = "n"
parts = [{ transform = "initial", field = "name" }]

[[blocking]]
name = "n:full"
parts = [{ transform = "exact", field = "name" }]
"#,
        );
        let err = LinkConfig::from_toml(&input).unwrap_err();
        assert!(matches!(err, LinkError::ConfigValidation(_)));
        assert!(err.to_string().contains("'n:full'"));
    }

    #[test]
    fn reject_inverted_cutoffs() {
        let input = with_fields(
            r#"
[[fields]]
name = "name"
type = "string"
metric = { kind = "exact" }

[classifier]
upper = 0.3
lower = 0.6
"#,
        );
        let err = LinkConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("exceeds upper cutoff"));
    }

    #[test]
    fn reject_config_without_compared_fields() {
        let input = with_fields(
            r#"
[[fields]]
name = "zipcode"
type = "categorical"
"#,
        );
        let err = LinkConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("needs a metric"));
    }

    #[test]
    fn reject_unknown_metric_kind() {
        let input = with_fields(
            r#"
[[fields]]
name = "name"
type = "string"
metric = { kind = "cosine" }
"#,
        );
        assert!(matches!(LinkConfig::from_toml(&input), Err(LinkError::ConfigParse(_))));
    }

    #[test]
    fn likelihood_ratio_cutoffs_must_be_positive() {
        let cutoffs = Cutoffs { scale: CutoffScale::LikelihoodRatio, upper: 100.0, lower: 0.0 };
        assert!(cutoffs.validate().is_err());
        let cutoffs = Cutoffs { scale: CutoffScale::LikelihoodRatio, upper: 100.0, lower: 0.01 };
        assert!(cutoffs.validate().is_ok());
    }
}
