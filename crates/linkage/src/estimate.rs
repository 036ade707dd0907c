//! Parameter estimator: fits the two-class Fellegi-Sunter mixture with EM.
//!
//! The estimator works on distinct comparison patterns (identical level
//! vectors weighted by multiplicity). Each iteration runs the E-step over
//! fixed-size chunks of patterns in parallel and merges the chunk statistics
//! in chunk order, so the M-step sees the same sums on every run.
//!
//! States: `Initialized → Iterating → Converged | MaxIterationsReached | BudgetExhausted`.
//! Parameters only leave the estimator inside a [`FittedModel`], which exists
//! only once a terminal state is reached.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::EstimatorConfig;
use crate::error::LinkError;
use crate::model::{ComparisonVector, FieldDistribution, ModelParameters};

const NORMALIZATION_TOLERANCE: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Status + report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationStatus {
    Converged,
    MaxIterationsReached,
    BudgetExhausted,
    /// Parameters were loaded, not fitted.
    Supplied,
}

impl EstimationStatus {
    pub fn is_converged(self) -> bool {
        matches!(self, Self::Converged | Self::Supplied)
    }
}

impl std::fmt::Display for EstimationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::MaxIterationsReached => write!(f, "max_iterations_reached"),
            Self::BudgetExhausted => write!(f, "budget_exhausted"),
            Self::Supplied => write!(f, "supplied"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Observed-data log-likelihood under the parameters entering this iteration.
    pub log_likelihood: f64,
    /// Sum of absolute parameter changes made by this iteration.
    pub delta: f64,
    pub prior: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EstimationReport {
    pub status: EstimationStatus,
    pub iterations: usize,
    pub pairs: usize,
    pub patterns: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_likelihood: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_delta: Option<f64>,
    pub trace: Vec<IterationRecord>,
}

impl EstimationReport {
    /// No estimation ran; `status` is the loaded model's.
    pub(crate) fn supplied(pairs: usize, status: EstimationStatus) -> Self {
        Self {
            status,
            iterations: 0,
            pairs,
            patterns: 0,
            log_likelihood: None,
            last_delta: None,
            trace: Vec::new(),
        }
    }
}

/// Parameters released by a finished estimator (or loaded from disk).
#[derive(Debug, Clone, PartialEq)]
pub struct FittedModel {
    params: ModelParameters,
    status: EstimationStatus,
}

impl FittedModel {
    /// Wrap parameters that were fitted elsewhere and validated against the schema.
    pub(crate) fn supplied(params: ModelParameters) -> Self {
        Self { params, status: EstimationStatus::Supplied }
    }

    /// Like [`FittedModel::supplied`], but a fit that stopped short keeps its status.
    pub(crate) fn loaded(params: ModelParameters, fitted_as: EstimationStatus) -> Self {
        let status = match fitted_as {
            EstimationStatus::Converged | EstimationStatus::Supplied => EstimationStatus::Supplied,
            stopped => stopped,
        };
        Self { params, status }
    }

    pub fn params(&self) -> &ModelParameters {
        &self.params
    }

    pub fn status(&self) -> EstimationStatus {
        self.status
    }

    pub fn into_params(self) -> ModelParameters {
        self.params
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorState {
    Initialized,
    Iterating { iteration: usize },
    Converged { iterations: usize },
    MaxIterationsReached { iterations: usize },
    BudgetExhausted { iterations: usize },
}

impl EstimatorState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Converged { .. } | Self::MaxIterationsReached { .. } | Self::BudgetExhausted { .. }
        )
    }
}

#[derive(Debug, Clone)]
struct Pattern {
    levels: Vec<Option<u8>>,
    count: f64,
}

pub struct Estimator {
    patterns: Vec<Pattern>,
    pairs: usize,
    level_counts: Vec<usize>,
    params: ModelParameters,
    config: EstimatorConfig,
    state: EstimatorState,
    iteration: usize,
    trace: Vec<IterationRecord>,
    /// Highest log-likelihood seen so far and the parameters that produced it.
    best: Option<(f64, ModelParameters)>,
    deadline: Option<Instant>,
}

impl Estimator {
    /// Build an estimator over comparison vectors.
    ///
    /// `records` is `(|A|, |B|)`, used to seed the prior when neither the
    /// config nor `initial` supplies one.
    pub fn new(
        vectors: &[ComparisonVector],
        fields: &[&str],
        level_counts: &[usize],
        records: (usize, usize),
        config: &EstimatorConfig,
        initial: Option<ModelParameters>,
    ) -> Result<Self, LinkError> {
        let mut counts: BTreeMap<&[Option<u8>], usize> = BTreeMap::new();
        for v in vectors {
            *counts.entry(v.levels.as_slice()).or_default() += 1;
        }
        let patterns: Vec<Pattern> = counts
            .into_iter()
            .map(|(levels, count)| Pattern { levels: levels.to_vec(), count: count as f64 })
            .collect();

        let params = match initial {
            Some(p) => {
                check_shape(&p, fields, level_counts)?;
                p
            }
            None => {
                let prior = config.initial_prior.unwrap_or_else(|| {
                    let (a, b) = records;
                    let pairs = vectors.len().max(1) as f64;
                    (a.min(b) as f64 / pairs).clamp(config.probability_floor, 0.5)
                });
                initial_parameters(fields, level_counts, prior)
            }
        };

        let deadline = config.max_duration_ms.map(|ms| Instant::now() + Duration::from_millis(ms));

        log::debug!(
            "estimator: {} pair(s) in {} distinct pattern(s), initial prior {:.6}",
            vectors.len(),
            patterns.len(),
            params.prior
        );

        Ok(Self {
            patterns,
            pairs: vectors.len(),
            level_counts: level_counts.to_vec(),
            params,
            config: config.clone(),
            state: EstimatorState::Initialized,
            iteration: 0,
            trace: Vec::new(),
            best: None,
            deadline,
        })
    }

    /// Replace the wall-clock budget (the earlier of the two wins).
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn state(&self) -> EstimatorState {
        self.state
    }

    pub fn trace(&self) -> &[IterationRecord] {
        &self.trace
    }

    /// Advance exactly one EM iteration and return the new state.
    /// Terminal states are sticky.
    pub fn step(&mut self) -> EstimatorState {
        if self.state.is_terminal() {
            return self.state;
        }
        if self.patterns.is_empty() {
            self.state = EstimatorState::Converged { iterations: 0 };
            return self.state;
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            self.state = EstimatorState::BudgetExhausted { iterations: self.iteration };
            return self.state;
        }

        let stats = self.expectation();
        let next = self.maximization(&stats);
        let delta = next.distance(&self.params);

        if self.best.as_ref().map_or(true, |(ll, _)| stats.log_likelihood > *ll) {
            self.best = Some((stats.log_likelihood, self.params.clone()));
        }

        self.iteration += 1;
        self.trace.push(IterationRecord {
            iteration: self.iteration,
            log_likelihood: stats.log_likelihood,
            delta,
            prior: next.prior,
        });
        log::debug!(
            "EM iteration {}: log-likelihood {:.6}, delta {:.3e}, prior {:.6}",
            self.iteration,
            stats.log_likelihood,
            delta,
            next.prior
        );
        self.params = next;

        self.state = if delta < self.config.tolerance {
            EstimatorState::Converged { iterations: self.iteration }
        } else if self.iteration >= self.config.max_iterations {
            EstimatorState::MaxIterationsReached { iterations: self.iteration }
        } else {
            EstimatorState::Iterating { iteration: self.iteration }
        };
        self.state
    }

    /// Iterate until a terminal state, then release the parameters.
    pub fn run(mut self) -> (FittedModel, EstimationReport) {
        while !self.step().is_terminal() {}
        self.finish()
    }

    fn finish(self) -> (FittedModel, EstimationReport) {
        let (status, iterations) = match self.state {
            EstimatorState::Converged { iterations } => (EstimationStatus::Converged, iterations),
            EstimatorState::MaxIterationsReached { iterations } => {
                (EstimationStatus::MaxIterationsReached, iterations)
            }
            EstimatorState::BudgetExhausted { iterations } => {
                (EstimationStatus::BudgetExhausted, iterations)
            }
            EstimatorState::Initialized | EstimatorState::Iterating { .. } => {
                (EstimationStatus::MaxIterationsReached, self.iteration)
            }
        };

        // A cut-short run hands back the best parameters it evaluated.
        let params = match (status, self.best) {
            (EstimationStatus::BudgetExhausted, Some((_, best))) => best,
            _ => self.params,
        };

        log::info!(
            "estimator {status} after {iterations} iteration(s), prior {:.6}",
            params.prior
        );

        let report = EstimationReport {
            status,
            iterations,
            pairs: self.pairs,
            patterns: self.patterns.len(),
            log_likelihood: self.trace.last().map(|r| r.log_likelihood),
            last_delta: self.trace.last().map(|r| r.delta),
            trace: self.trace,
        };
        (FittedModel { params, status }, report)
    }

    // -----------------------------------------------------------------------
    // E-step / M-step
    // -----------------------------------------------------------------------

    fn expectation(&self) -> Sufficient {
        let ln_prior = self.params.prior.ln();
        let ln_not_prior = (1.0 - self.params.prior).ln();
        let ln_m: Vec<Vec<f64>> =
            self.params.fields.iter().map(|f| f.m.iter().map(|p| p.ln()).collect()).collect();
        let ln_u: Vec<Vec<f64>> =
            self.params.fields.iter().map(|f| f.u.iter().map(|p| p.ln()).collect()).collect();

        let chunks: Vec<Sufficient> = self
            .patterns
            .par_chunks(self.config.chunk_size)
            .map(|chunk| {
                let mut acc = Sufficient::zero(&self.level_counts);
                for pattern in chunk {
                    let mut log_m = ln_prior;
                    let mut log_u = ln_not_prior;
                    for (f, level) in pattern.levels.iter().enumerate() {
                        if let Some(l) = level {
                            log_m += ln_m[f][*l as usize];
                            log_u += ln_u[f][*l as usize];
                        }
                    }
                    let total = log_sum_exp(log_m, log_u);
                    let g = (log_m - total).exp();
                    acc.log_likelihood += pattern.count * total;
                    acc.matches += pattern.count * g;
                    for (f, level) in pattern.levels.iter().enumerate() {
                        if let Some(l) = level {
                            acc.m[f][*l as usize] += pattern.count * g;
                            acc.u[f][*l as usize] += pattern.count * (1.0 - g);
                        }
                    }
                }
                acc
            })
            .collect();

        chunks
            .into_iter()
            .fold(Sufficient::zero(&self.level_counts), Sufficient::merge)
    }

    fn maximization(&self, stats: &Sufficient) -> ModelParameters {
        let floor = self.config.probability_floor;
        let total: f64 = self.patterns.iter().map(|p| p.count).sum();
        let prior = (stats.matches / total).clamp(floor, 1.0 - floor);

        let fields = self
            .params
            .fields
            .iter()
            .enumerate()
            .map(|(f, prev)| FieldDistribution {
                name: prev.name.clone(),
                m: reestimate(&stats.m[f], &prev.m, floor),
                u: reestimate(&stats.u[f], &prev.u, floor),
            })
            .collect();

        ModelParameters { prior, fields }
    }
}

/// Weighted level counts accumulated by one E-step chunk.
#[derive(Debug, Clone)]
struct Sufficient {
    log_likelihood: f64,
    matches: f64,
    m: Vec<Vec<f64>>,
    u: Vec<Vec<f64>>,
}

impl Sufficient {
    fn zero(level_counts: &[usize]) -> Self {
        Self {
            log_likelihood: 0.0,
            matches: 0.0,
            m: level_counts.iter().map(|&n| vec![0.0; n]).collect(),
            u: level_counts.iter().map(|&n| vec![0.0; n]).collect(),
        }
    }

    fn merge(mut self, other: Sufficient) -> Self {
        self.log_likelihood += other.log_likelihood;
        self.matches += other.matches;
        for (mine, theirs) in self.m.iter_mut().zip(&other.m) {
            for (x, y) in mine.iter_mut().zip(theirs) {
                *x += y;
            }
        }
        for (mine, theirs) in self.u.iter_mut().zip(&other.u) {
            for (x, y) in mine.iter_mut().zip(theirs) {
                *x += y;
            }
        }
        self
    }
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Normalize weighted counts; a field never observed keeps its previous distribution.
fn reestimate(counts: &[f64], previous: &[f64], floor: f64) -> Vec<f64> {
    let total: f64 = counts.iter().sum();
    if !(total > 0.0) {
        return previous.to_vec();
    }
    let mut p: Vec<f64> = counts.iter().map(|c| c / total).collect();
    apply_floor(&mut p, floor);
    p
}

/// Clamp into [floor, 1 - floor], then renormalize to sum to 1.
pub fn apply_floor(p: &mut [f64], floor: f64) {
    for x in p.iter_mut() {
        *x = x.clamp(floor, 1.0 - floor);
    }
    let total: f64 = p.iter().sum();
    for x in p.iter_mut() {
        *x /= total;
    }
}

/// Heuristic seed: m rises with agreement level (∝ (l+1)²), u mirrors it.
pub fn initial_parameters(fields: &[&str], level_counts: &[usize], prior: f64) -> ModelParameters {
    let fields = fields
        .iter()
        .zip(level_counts)
        .map(|(name, &n)| {
            let weights: Vec<f64> = (0..n).map(|l| ((l + 1) * (l + 1)) as f64).collect();
            let total: f64 = weights.iter().sum();
            let m: Vec<f64> = weights.iter().map(|w| w / total).collect();
            let u: Vec<f64> = m.iter().rev().copied().collect();
            FieldDistribution { name: name.to_string(), m, u }
        })
        .collect();
    ModelParameters { prior, fields }
}

fn check_shape(params: &ModelParameters, fields: &[&str], level_counts: &[usize]) -> Result<(), LinkError> {
    let mismatch = |detail: String| LinkError::ConfigValidation(format!("initial parameters: {detail}"));
    if params.fields.len() != fields.len() {
        return Err(mismatch(format!(
            "{} field(s) given, {} compared",
            params.fields.len(),
            fields.len()
        )));
    }
    for ((dist, name), &n) in params.fields.iter().zip(fields).zip(level_counts) {
        if dist.name != *name {
            return Err(mismatch(format!("expected field '{name}', found '{}'", dist.name)));
        }
        if dist.m.len() != n || dist.u.len() != n {
            return Err(mismatch(format!("field '{name}' needs {n} level(s)")));
        }
    }
    check_probabilities(params).map_err(mismatch)
}

/// The prior and every m/u entry lie strictly inside (0, 1), and each
/// distribution sums to 1. Anything else yields infinite or NaN log ratios.
pub(crate) fn check_probabilities(params: &ModelParameters) -> Result<(), String> {
    if !(params.prior > 0.0 && params.prior < 1.0) {
        return Err(format!("prior {} outside (0, 1)", params.prior));
    }
    for dist in &params.fields {
        for (which, probs) in [("m", &dist.m), ("u", &dist.u)] {
            if probs.iter().any(|p| !(*p > 0.0 && *p < 1.0)) {
                return Err(format!("field '{}' has an {which} probability outside (0, 1)", dist.name));
            }
            let total: f64 = probs.iter().sum();
            if (total - 1.0).abs() > NORMALIZATION_TOLERANCE {
                return Err(format!("field '{}' {which} probabilities sum to {total}", dist.name));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIELDS: [&str; 3] = ["first", "last", "year"];
    const LEVELS: [usize; 3] = [2, 2, 2];

    fn vectors() -> Vec<ComparisonVector> {
        let groups: [([u8; 3], usize); 8] = [
            ([1, 1, 1], 10),
            ([1, 1, 0], 2),
            ([1, 0, 1], 2),
            ([0, 1, 1], 2),
            ([0, 0, 0], 70),
            ([1, 0, 0], 6),
            ([0, 1, 0], 5),
            ([0, 0, 1], 3),
        ];
        let mut out = Vec::new();
        for (levels, count) in groups {
            for _ in 0..count {
                out.push(ComparisonVector {
                    levels: levels.iter().map(|l| Some(*l)).collect(),
                    similarities: levels.iter().map(|l| Some(*l as f64)).collect(),
                });
            }
        }
        out
    }

    fn estimator(config: &EstimatorConfig) -> Estimator {
        Estimator::new(&vectors(), &FIELDS, &LEVELS, (10, 10), config, None).unwrap()
    }

    #[test]
    fn seed_parameters_are_normalized_and_mirrored() {
        let p = initial_parameters(&["a", "b"], &[2, 3], 0.1);
        assert_eq!(p.fields[0].m, vec![0.2, 0.8]);
        assert_eq!(p.fields[0].u, vec![0.8, 0.2]);
        let sum: f64 = p.fields[1].m.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!((p.fields[1].m[2] - 9.0 / 14.0).abs() < 1e-12);
    }

    #[test]
    fn em_converges_and_separates_classes() {
        let (model, report) = estimator(&EstimatorConfig::default()).run();
        assert_eq!(report.status, EstimationStatus::Converged);
        assert_eq!(report.patterns, 8);
        assert_eq!(report.pairs, 100);
        let params = model.params();
        assert!(params.prior > 0.1 && params.prior < 0.25, "prior {}", params.prior);
        for field in &params.fields {
            assert!(field.m[1] > 0.8 && field.u[1] < 0.1, "{field:?}");
            assert!((field.m.iter().sum::<f64>() - 1.0).abs() < 1e-12);
            assert!((field.u.iter().sum::<f64>() - 1.0).abs() < 1e-12);
            assert!(field.m.iter().chain(&field.u).all(|p| *p > 0.0 && *p < 1.0));
        }
    }

    #[test]
    fn log_likelihood_never_decreases() {
        let (_, report) = estimator(&EstimatorConfig::default()).run();
        for w in report.trace.windows(2) {
            let (prev, next) = (w[0].log_likelihood, w[1].log_likelihood);
            assert!(next >= prev - 1e-9 * (1.0 + prev.abs()), "{prev} -> {next}");
        }
    }

    #[test]
    fn iteration_cap_reports_non_convergence() {
        let config = EstimatorConfig { max_iterations: 1, ..EstimatorConfig::default() };
        let (model, report) = estimator(&config).run();
        assert_eq!(report.status, EstimationStatus::MaxIterationsReached);
        assert_eq!(report.iterations, 1);
        assert!(!model.status().is_converged());
        assert!(report.last_delta.unwrap() >= config.tolerance);
    }

    #[test]
    fn expired_deadline_exhausts_budget_without_iterating() {
        let est = estimator(&EstimatorConfig::default()).with_deadline(Instant::now());
        let (model, report) = est.run();
        assert_eq!(report.status, EstimationStatus::BudgetExhausted);
        assert_eq!(report.iterations, 0);
        assert_eq!(model.params().fields[0].m, vec![0.2, 0.8]);
    }

    #[test]
    fn step_walks_the_state_machine() {
        let mut est = estimator(&EstimatorConfig::default());
        assert_eq!(est.state(), EstimatorState::Initialized);
        assert_eq!(est.step(), EstimatorState::Iterating { iteration: 1 });
        assert_eq!(est.trace().len(), 1);
        while !est.step().is_terminal() {}
        let terminal = est.state();
        assert!(matches!(terminal, EstimatorState::Converged { .. }));
        assert_eq!(est.step(), terminal);
    }

    #[test]
    fn no_pairs_converges_immediately() {
        let est = Estimator::new(&[], &FIELDS, &LEVELS, (0, 0), &EstimatorConfig::default(), None).unwrap();
        let (_, report) = est.run();
        assert_eq!(report.status, EstimationStatus::Converged);
        assert_eq!(report.iterations, 0);
    }

    #[test]
    fn chunking_does_not_change_the_fit() {
        let small = EstimatorConfig { chunk_size: 1, ..EstimatorConfig::default() };
        let (a, _) = estimator(&small).run();
        let (b, _) = estimator(&EstimatorConfig::default()).run();
        assert!(a.params().distance(b.params()) < 1e-9);

        let (c, _) = estimator(&small).run();
        assert_eq!(a, c);
    }

    #[test]
    fn missing_levels_are_skipped() {
        let mut data = vectors();
        for v in data.iter_mut().step_by(5) {
            v.levels[2] = None;
            v.similarities[2] = None;
        }
        let est = Estimator::new(&data, &FIELDS, &LEVELS, (10, 10), &EstimatorConfig::default(), None).unwrap();
        let (model, report) = est.run();
        assert_eq!(report.status, EstimationStatus::Converged);
        assert!(model.params().fields[2].m[1] > model.params().fields[2].u[1]);
    }

    #[test]
    fn mis_shaped_initial_parameters_are_rejected() {
        let bad = initial_parameters(&["first", "last"], &[2, 2], 0.1);
        let err = Estimator::new(&vectors(), &FIELDS, &LEVELS, (10, 10), &EstimatorConfig::default(), Some(bad));
        assert!(matches!(err, Err(LinkError::ConfigValidation(_))));
    }

    #[test]
    fn unnormalized_initial_parameters_are_rejected() {
        let mut bad = initial_parameters(&FIELDS, &LEVELS, 0.1);
        bad.fields[1].u = vec![0.5, 0.6];
        let err = Estimator::new(&vectors(), &FIELDS, &LEVELS, (10, 10), &EstimatorConfig::default(), Some(bad));
        let Err(LinkError::ConfigValidation(msg)) = err else {
            panic!("unnormalized u accepted");
        };
        assert!(msg.contains("'last' u probabilities sum to"), "{msg}");

        let mut degenerate = initial_parameters(&FIELDS, &LEVELS, 0.1);
        degenerate.fields[0].m = vec![0.0, 1.0];
        assert!(check_probabilities(&degenerate).unwrap_err().contains("'first' has an m probability"));
    }

    #[test]
    fn floor_keeps_probabilities_inside_unit_interval() {
        let mut p = vec![0.0, 1.0];
        apply_floor(&mut p, 1e-3);
        assert!(p[0] > 0.0 && p[1] < 1.0);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }
}
