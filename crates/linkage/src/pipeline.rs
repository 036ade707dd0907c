use std::time::Instant;

use crate::block;
use crate::classify::Classifier;
use crate::compare::Comparator;
use crate::config::LinkConfig;
use crate::error::{LinkError, LinkWarning};
use crate::estimate::{EstimationReport, Estimator};
use crate::evaluate::{evaluate, EvaluationInput};
use crate::model::{LinkInput, LinkMeta, LinkResult, ModelParameters, Side};
use crate::normalize::normalize_records;
use crate::persist::{schema_fingerprint, PersistedModel};
use crate::resolve::resolve;

/// Optional inputs that change how parameters are obtained.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Seed the estimator with these instead of the heuristic start.
    pub initial: Option<ModelParameters>,
    /// Skip estimation and classify with previously fitted parameters.
    pub model: Option<PersistedModel>,
    /// Wall-clock cutoff for the estimator.
    pub deadline: Option<Instant>,
}

/// Run the full linkage pipeline per config.
pub fn run(config: &LinkConfig, input: &LinkInput) -> Result<LinkResult, LinkError> {
    run_with(config, input, RunOptions::default())
}

pub fn run_with(config: &LinkConfig, input: &LinkInput, options: RunOptions) -> Result<LinkResult, LinkError> {
    let fingerprint = schema_fingerprint(config)?;
    let supplied = options.model.map(|m| m.into_fitted(config)).transpose()?;

    let set_a = normalize_records(Side::A, &input.a, config)?;
    let set_b = normalize_records(Side::B, &input.b, config)?;
    let (a, b) = (set_a.records, set_b.records);
    let mut warnings: Vec<LinkWarning> = set_a.warnings;
    warnings.extend(set_b.warnings);

    let blocking = block::block(&a, &b, config);
    warnings.extend(blocking.warnings);
    let pairs = blocking.pairs;

    let comparator = Comparator::new(config);
    let vectors = comparator.compare_pairs(&a, &b, &pairs);
    let fields = comparator.fields();

    let loaded = supplied.is_some();
    let (model, estimation) = match supplied {
        Some(model) => {
            let status = model.status();
            (model, EstimationReport::supplied(pairs.len(), status))
        }
        None => {
            let mut estimator = Estimator::new(
                &vectors,
                &fields,
                &comparator.level_counts(),
                (a.len(), b.len()),
                &config.estimator,
                options.initial,
            )?;
            if let Some(deadline) = options.deadline {
                estimator = estimator.with_deadline(deadline);
            }
            estimator.run()
        }
    };

    if !estimation.status.is_converged() {
        let warning = LinkWarning::NonConvergence {
            iterations: estimation.iterations,
            last_delta: estimation.last_delta.unwrap_or(f64::NAN),
            reason: if loaded {
                format!("saved model was fitted with status {}", estimation.status)
            } else {
                estimation.status.to_string()
            },
        };
        log::warn!("{warning}");
        warnings.push(warning);
    }

    let classifier = Classifier::new(&model, config.classifier);
    let mut decisions = classifier.classify(&a, &b, &pairs, &vectors);
    let resolved = resolve(&mut decisions, &config.resolver)?;

    let join_fields: Vec<&str> = config.fields.iter().map(|f| f.name.as_str()).collect();
    let evaluation = evaluate(
        &EvaluationInput {
            a: &a,
            b: &b,
            pairs: &pairs,
            vectors: &vectors,
            decisions: &decisions,
            clusters: &resolved.clusters,
            compared: &fields,
            join_fields: &join_fields,
            truth: input.truth.as_deref(),
        },
        &config.evaluation,
    );

    Ok(LinkResult {
        meta: LinkMeta {
            config_name: config.name.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            run_at: chrono::Utc::now().to_rfc3339(),
            schema_fingerprint: fingerprint,
            records_a: a.len(),
            records_b: b.len(),
        },
        blocking: blocking.stats,
        estimation,
        model: model.into_params(),
        decisions,
        clusters: resolved.clusters,
        conflicts: resolved.conflicts,
        evaluation,
        warnings,
    })
}
