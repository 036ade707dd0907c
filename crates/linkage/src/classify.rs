//! Classifier: likelihood ratios and posteriors from fitted parameters,
//! then match / review / non_match labels from two cutoffs.
//!
//! Scores depend only on the fitted parameters. Cutoffs are applied
//! afterwards, so relabelling with new cutoffs never touches the model.

use rayon::prelude::*;

use crate::config::{CutoffScale, Cutoffs};
use crate::estimate::FittedModel;
use crate::model::{CandidatePair, ComparisonVector, LinkDecision, LinkLabel, Record};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    /// ln P(vector | match) - ln P(vector | non-match)
    pub log_likelihood_ratio: f64,
    pub posterior: f64,
}

impl Score {
    /// Fellegi-Sunter match weight in bits.
    pub fn match_weight(&self) -> f64 {
        self.log_likelihood_ratio / std::f64::consts::LN_2
    }
}

pub struct Classifier {
    ln_m: Vec<Vec<f64>>,
    ln_u: Vec<Vec<f64>>,
    prior_log_odds: f64,
    cutoffs: Cutoffs,
}

impl Classifier {
    pub fn new(model: &FittedModel, cutoffs: Cutoffs) -> Self {
        let params = model.params();
        Self {
            ln_m: params.fields.iter().map(|f| f.m.iter().map(|p| p.ln()).collect()).collect(),
            ln_u: params.fields.iter().map(|f| f.u.iter().map(|p| p.ln()).collect()).collect(),
            prior_log_odds: params.prior.ln() - (1.0 - params.prior).ln(),
            cutoffs,
        }
    }

    pub fn cutoffs(&self) -> &Cutoffs {
        &self.cutoffs
    }

    /// Incomparable slots contribute nothing to the ratio.
    pub fn score(&self, vector: &ComparisonVector) -> Score {
        let log_likelihood_ratio: f64 = vector
            .levels
            .iter()
            .enumerate()
            .filter_map(|(f, level)| level.map(|l| self.ln_m[f][l as usize] - self.ln_u[f][l as usize]))
            .sum();
        Score {
            log_likelihood_ratio,
            posterior: sigmoid(self.prior_log_odds + log_likelihood_ratio),
        }
    }

    pub fn label(&self, score: &Score) -> LinkLabel {
        label(&self.cutoffs, score)
    }

    /// Score and label every candidate pair. Output is index-aligned with `pairs`.
    pub fn classify(
        &self,
        a: &[Record],
        b: &[Record],
        pairs: &[CandidatePair],
        vectors: &[ComparisonVector],
    ) -> Vec<LinkDecision> {
        pairs
            .par_iter()
            .zip(vectors.par_iter())
            .map(|(pair, vector)| {
                let score = self.score(vector);
                LinkDecision {
                    a_id: a[pair.a].id().to_string(),
                    b_id: b[pair.b].id().to_string(),
                    log_likelihood_ratio: score.log_likelihood_ratio,
                    match_weight: score.match_weight(),
                    posterior: score.posterior,
                    label: self.label(&score),
                    demoted: false,
                    aggregate_distance: vector.aggregate_distance(),
                }
            })
            .collect()
    }
}

/// `score >= upper` → match, `score <= lower` → non_match, otherwise review.
pub fn label(cutoffs: &Cutoffs, score: &Score) -> LinkLabel {
    let (value, upper, lower) = match cutoffs.scale {
        CutoffScale::Posterior => (score.posterior, cutoffs.upper, cutoffs.lower),
        CutoffScale::LikelihoodRatio => {
            (score.log_likelihood_ratio, cutoffs.upper.ln(), cutoffs.lower.ln())
        }
    };
    if value >= upper {
        LinkLabel::Match
    } else if value <= lower {
        LinkLabel::NonMatch
    } else {
        LinkLabel::Review
    }
}

/// Relabel stored decisions under new cutoffs. Clears resolver demotions,
/// so resolution has to run again afterwards.
pub fn apply_cutoffs(decisions: &mut [LinkDecision], cutoffs: &Cutoffs) {
    for d in decisions.iter_mut() {
        let score = Score { log_likelihood_ratio: d.log_likelihood_ratio, posterior: d.posterior };
        d.label = label(cutoffs, &score);
        d.demoted = false;
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}
