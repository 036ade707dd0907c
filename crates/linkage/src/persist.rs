//! Persisted model parameters, keyed by a fingerprint of the comparison schema.
//!
//! Parameters fitted under one schema are meaningless under another (a level
//! index means something different once thresholds change), so loading
//! checks the fingerprint before anything reaches the classifier.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{FieldType, LinkConfig, Metric};
use crate::error::LinkError;
use crate::estimate::{check_probabilities, EstimationStatus, FittedModel};
use crate::model::{FieldDistribution, LinkResult, ModelParameters};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedModel {
    pub format_version: u32,
    /// `sha256:<hex>` of the compared fields' canonical JSON.
    pub schema_fingerprint: String,
    pub prior: f64,
    pub fields: Vec<FieldDistribution>,
    /// Estimator outcome when the parameters were saved.
    pub status: EstimationStatus,
}

#[derive(Serialize)]
struct FieldSignature<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    field_type: FieldType,
    metric: &'a Metric,
    levels: Vec<f64>,
}

/// SHA-256 over the (name, type, metric, levels) of every compared field, in order.
pub fn schema_fingerprint(config: &LinkConfig) -> Result<String, LinkError> {
    let signature: Vec<FieldSignature<'_>> = config
        .compared_fields()
        .into_iter()
        .filter_map(|f| {
            f.metric.as_ref().map(|metric| FieldSignature {
                name: &f.name,
                field_type: f.field_type,
                metric,
                levels: f.thresholds(),
            })
        })
        .collect();
    let canonical = serde_json::to_string(&signature).map_err(|e| LinkError::Serialization(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

impl PersistedModel {
    pub fn from_fitted(model: &FittedModel, config: &LinkConfig) -> Result<Self, LinkError> {
        let params = model.params();
        Ok(Self {
            format_version: FORMAT_VERSION,
            schema_fingerprint: schema_fingerprint(config)?,
            prior: params.prior,
            fields: params.fields.clone(),
            status: model.status(),
        })
    }

    /// Parameters of a finished run, under the fingerprint that run recorded.
    pub fn from_result(result: &LinkResult) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            schema_fingerprint: result.meta.schema_fingerprint.clone(),
            prior: result.model.prior,
            fields: result.model.fields.clone(),
            status: result.estimation.status,
        }
    }

    pub fn to_json(&self) -> Result<String, LinkError> {
        serde_json::to_string_pretty(self).map_err(|e| LinkError::Serialization(e.to_string()))
    }

    pub fn from_json(input: &str) -> Result<Self, LinkError> {
        serde_json::from_str(input).map_err(|e| LinkError::Serialization(e.to_string()))
    }

    /// Check version, fingerprint and probability ranges, then release the
    /// parameters for classification. A fit saved short of convergence keeps
    /// its status.
    pub fn into_fitted(self, config: &LinkConfig) -> Result<FittedModel, LinkError> {
        if self.format_version != FORMAT_VERSION {
            return Err(LinkError::ConfigurationMismatch {
                expected: format!("format version {FORMAT_VERSION}"),
                found: format!("format version {}", self.format_version),
            });
        }
        let expected = schema_fingerprint(config)?;
        if self.schema_fingerprint != expected {
            return Err(LinkError::ConfigurationMismatch { expected, found: self.schema_fingerprint });
        }

        for (dist, field) in self.fields.iter().zip(config.compared_fields()) {
            let n = field.level_count();
            if dist.name != field.name || dist.m.len() != n || dist.u.len() != n {
                return Err(LinkError::ConfigurationMismatch {
                    expected: format!("field '{}' with {n} level(s)", field.name),
                    found: format!("field '{}' with {} level(s)", dist.name, dist.m.len()),
                });
            }
        }
        if self.fields.len() != config.compared_fields().len() {
            return Err(LinkError::ConfigurationMismatch {
                expected: format!("{} compared field(s)", config.compared_fields().len()),
                found: format!("{} field(s)", self.fields.len()),
            });
        }

        let params = ModelParameters { prior: self.prior, fields: self.fields };
        check_probabilities(&params).map_err(|detail| LinkError::ConfigValidation(format!("saved model: {detail}")))?;
        Ok(FittedModel::loaded(params, self.status))
    }
}
