//! Evaluator: link quality against ground truth, and proxy diagnostics
//! that need none.
//!
//! Proxy diagnostics bin decisions by posterior and report, per compared
//! field, the mean similarity and mean raw distance inside each bin. If the
//! model is doing its job, agreement tightens as the posterior rises.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::config::EvaluationConfig;
use crate::deterministic;
use crate::model::{CandidatePair, ComparisonVector, FieldValue, LinkCluster, LinkDecision, LinkLabel, Record};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LabelCounts {
    #[serde(rename = "match")]
    pub matches: usize,
    pub review: usize,
    pub non_match: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroundTruthMetrics {
    pub true_links: usize,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
    /// Share of true links that survived blocking.
    pub pair_completeness: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldBinStats {
    pub field: String,
    /// Pairs in the bin where this field was comparable.
    pub observed: usize,
    pub mean_similarity: Option<f64>,
    /// Edit distance for text, absolute difference for numbers, days for dates.
    pub mean_distance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PosteriorBin {
    pub lower: f64,
    pub upper: f64,
    pub pairs: usize,
    pub fields: Vec<FieldBinStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPoint {
    pub threshold: f64,
    pub matches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub label_counts: LabelCounts,
    pub predicted_links: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ground_truth: Option<GroundTruthMetrics>,
    pub posterior_bins: Vec<PosteriorBin>,
    /// Per field: mean similarity never drops from one non-empty bin to the next.
    pub agreement_tightens: BTreeMap<String, bool>,
    pub threshold_sweep: Vec<SweepPoint>,
    /// Pairs an exact join on every schema field would link.
    pub deterministic_matches: usize,
}

/// Everything the evaluator reads. Nothing here is mutated.
pub struct EvaluationInput<'a> {
    pub a: &'a [Record],
    pub b: &'a [Record],
    pub pairs: &'a [CandidatePair],
    pub vectors: &'a [ComparisonVector],
    pub decisions: &'a [LinkDecision],
    pub clusters: &'a [LinkCluster],
    /// Compared fields, in comparison-vector order.
    pub compared: &'a [&'a str],
    /// Fields used by the deterministic baseline join.
    pub join_fields: &'a [&'a str],
    pub truth: Option<&'a [(String, String)]>,
}

pub fn evaluate(input: &EvaluationInput<'_>, config: &EvaluationConfig) -> EvaluationSummary {
    let mut label_counts = LabelCounts::default();
    for d in input.decisions {
        match d.label {
            LinkLabel::Match => label_counts.matches += 1,
            LinkLabel::Review => label_counts.review += 1,
            LinkLabel::NonMatch => label_counts.non_match += 1,
        }
    }

    let predicted: HashSet<(&str, &str)> = input
        .clusters
        .iter()
        .flat_map(|c| c.links.iter().map(|l| (l.a_id.as_str(), l.b_id.as_str())))
        .collect();

    let ground_truth = input.truth.map(|truth| ground_truth_metrics(input, &predicted, truth));
    if let Some(m) = &ground_truth {
        log::info!(
            "evaluation: precision {}, recall {}, pair completeness {}",
            fmt_ratio(m.precision),
            fmt_ratio(m.recall),
            fmt_ratio(m.pair_completeness)
        );
    }

    let posterior_bins = posterior_bins(input, config);
    let agreement_tightens = input
        .compared
        .iter()
        .enumerate()
        .map(|(f, name)| {
            let means: Vec<f64> = posterior_bins.iter().filter_map(|bin| bin.fields[f].mean_similarity).collect();
            let tightens = means.windows(2).all(|w| w[1] >= w[0] - 1e-12);
            (name.to_string(), tightens)
        })
        .collect();

    EvaluationSummary {
        label_counts,
        predicted_links: predicted.len(),
        ground_truth,
        posterior_bins,
        agreement_tightens,
        threshold_sweep: threshold_sweep(input.decisions, config.sweep_step),
        deterministic_matches: deterministic::exact_join(input.a, input.b, input.join_fields).len(),
    }
}

fn fmt_ratio(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.4}"))
}

fn ground_truth_metrics(
    input: &EvaluationInput<'_>,
    predicted: &HashSet<(&str, &str)>,
    truth: &[(String, String)],
) -> GroundTruthMetrics {
    let truth: HashSet<(&str, &str)> = truth.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
    let true_positives = predicted.intersection(&truth).count();
    let false_positives = predicted.len() - true_positives;
    let false_negatives = truth.len() - true_positives;

    let precision = ratio(true_positives, predicted.len());
    let recall = ratio(true_positives, truth.len());
    let f1 = match (precision, recall) {
        (Some(p), Some(r)) if p + r > 0.0 => Some(2.0 * p * r / (p + r)),
        (Some(_), Some(_)) => Some(0.0),
        _ => None,
    };

    let blocked: HashSet<(&str, &str)> = input
        .pairs
        .iter()
        .map(|p| (input.a[p.a].id(), input.b[p.b].id()))
        .collect();
    let surviving = truth.iter().filter(|pair| blocked.contains(*pair)).count();

    GroundTruthMetrics {
        true_links: truth.len(),
        true_positives,
        false_positives,
        false_negatives,
        precision,
        recall,
        f1,
        pair_completeness: ratio(surviving, truth.len()),
    }
}

fn ratio(numerator: usize, denominator: usize) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

/// Raw distance behind a similarity: edit distance for text, |Δ| otherwise.
pub fn raw_distance(a: &FieldValue, b: &FieldValue) -> Option<f64> {
    match (a.as_text(), b.as_text()) {
        (Some(x), Some(y)) => Some(strsim::levenshtein(x, y) as f64),
        _ => Some((a.as_number()? - b.as_number()?).abs()),
    }
}

fn posterior_bins(input: &EvaluationInput<'_>, config: &EvaluationConfig) -> Vec<PosteriorBin> {
    let n = config.posterior_bins;
    let fields = input.compared.len();

    // Per bin, per field: (observed, similarity sum, distance count, distance sum)
    let mut pairs = vec![0usize; n];
    let mut acc = vec![vec![(0usize, 0.0f64, 0usize, 0.0f64); fields]; n];

    for ((decision, pair), vector) in input.decisions.iter().zip(input.pairs).zip(input.vectors) {
        if !(decision.posterior > config.diagnostic_floor) {
            continue;
        }
        let bin = ((decision.posterior * n as f64).ceil() as usize).saturating_sub(1).min(n - 1);
        pairs[bin] += 1;
        for (f, name) in input.compared.iter().enumerate() {
            let Some(similarity) = vector.similarities[f] else {
                continue;
            };
            let slot = &mut acc[bin][f];
            slot.0 += 1;
            slot.1 += similarity;
            if let Some(d) = raw_distance(input.a[pair.a].value(name), input.b[pair.b].value(name)) {
                slot.2 += 1;
                slot.3 += d;
            }
        }
    }

    (0..n)
        .map(|i| PosteriorBin {
            lower: i as f64 / n as f64,
            upper: (i + 1) as f64 / n as f64,
            pairs: pairs[i],
            fields: input
                .compared
                .iter()
                .enumerate()
                .map(|(f, name)| {
                    let (observed, sim_sum, dist_count, dist_sum) = acc[i][f];
                    FieldBinStats {
                        field: name.to_string(),
                        observed,
                        mean_similarity: (observed > 0).then(|| sim_sum / observed as f64),
                        mean_distance: (dist_count > 0).then(|| dist_sum / dist_count as f64),
                    }
                })
                .collect(),
        })
        .collect()
}

/// Matches at posterior thresholds 0, step, 2·step, …, 1.
pub fn threshold_sweep(decisions: &[LinkDecision], step: f64) -> Vec<SweepPoint> {
    let point = |threshold: f64| SweepPoint {
        threshold,
        matches: decisions.iter().filter(|d| d.posterior >= threshold).count(),
    };
    let steps = (1.0 / step + 1e-9).floor() as usize;
    let mut sweep: Vec<SweepPoint> = (0..=steps).map(|k| point((k as f64 * step).min(1.0))).collect();
    // The grid always ends at 1.0, even when the step does not divide it.
    if sweep.last().map_or(true, |p| p.threshold < 1.0 - 1e-9) {
        sweep.push(point(1.0));
    }
    sweep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::model::{ClusterLink, RawRecord, Resolution, Side};
    use crate::normalize::normalize_records;

    const CONFIG: &str = r#"
name = "t"

[[fields]]
name = "name"
type = "string"
metric = { kind = "jaro_winkler" }

[[fields]]
name = "year"
type = "numeric"
metric = { kind = "abs_diff" }
"#;

    struct Fixture {
        a: Vec<Record>,
        b: Vec<Record>,
        pairs: Vec<CandidatePair>,
        vectors: Vec<ComparisonVector>,
        decisions: Vec<LinkDecision>,
        clusters: Vec<LinkCluster>,
    }

    fn decision(a: &str, b: &str, posterior: f64, label: LinkLabel) -> LinkDecision {
        LinkDecision {
            a_id: a.into(),
            b_id: b.into(),
            log_likelihood_ratio: 0.0,
            match_weight: 0.0,
            posterior,
            label,
            demoted: false,
            aggregate_distance: 0.0,
        }
    }

    fn cluster(a: &str, b: &str, posterior: f64) -> LinkCluster {
        LinkCluster {
            cluster_id: 0,
            a_ids: vec![a.into()],
            b_ids: vec![b.into()],
            links: vec![ClusterLink { a_id: a.into(), b_id: b.into(), posterior }],
            posterior,
            resolution: Resolution { tiebreak: None, competitors: 0 },
        }
    }

    fn fixture() -> Fixture {
        let config = LinkConfig::from_toml(CONFIG).unwrap();
        let rows = |side, rows: &[(&str, &str, &str)]| {
            let raws: Vec<RawRecord> =
                rows.iter().map(|(id, n, y)| RawRecord::new(*id, [("name", *n), ("year", *y)])).collect();
            normalize_records(side, &raws, &config).unwrap().records
        };
        let a = rows(Side::A, &[("1", "anna", "1980"), ("2", "bert", "1990")]);
        let b = rows(Side::B, &[("1", "anna", "1980"), ("2", "bart", "1992"), ("3", "zed", "")]);
        let pairs = vec![
            CandidatePair { a: 0, b: 0, block_keys: vec!["*".into()] },
            CandidatePair { a: 1, b: 1, block_keys: vec!["*".into()] },
            CandidatePair { a: 1, b: 2, block_keys: vec!["*".into()] },
        ];
        let vectors = vec![
            ComparisonVector { levels: vec![Some(2), Some(2)], similarities: vec![Some(1.0), Some(1.0)] },
            ComparisonVector { levels: vec![Some(1), Some(0)], similarities: vec![Some(0.88), Some(1.0 / 3.0)] },
            ComparisonVector { levels: vec![Some(0), None], similarities: vec![Some(0.0), None] },
        ];
        let decisions = vec![
            decision("1", "1", 0.999, LinkLabel::Match),
            decision("2", "2", 0.42, LinkLabel::NonMatch),
            decision("2", "3", 1e-9, LinkLabel::NonMatch),
        ];
        let clusters = vec![cluster("1", "1", 0.999)];
        Fixture { a, b, pairs, vectors, decisions, clusters }
    }

    fn run(fx: &Fixture, truth: Option<&[(String, String)]>) -> EvaluationSummary {
        let input = EvaluationInput {
            a: &fx.a,
            b: &fx.b,
            pairs: &fx.pairs,
            vectors: &fx.vectors,
            decisions: &fx.decisions,
            clusters: &fx.clusters,
            compared: &["name", "year"],
            join_fields: &["name", "year"],
            truth,
        };
        evaluate(&input, &EvaluationConfig::default())
    }

    #[test]
    fn precision_recall_and_completeness() {
        let fx = fixture();
        let truth = vec![("1".to_string(), "1".to_string()), ("2".to_string(), "2".to_string())];
        let summary = run(&fx, Some(truth.as_slice()));
        let gt = summary.ground_truth.unwrap();
        assert_eq!(gt.true_positives, 1);
        assert_eq!(gt.false_negatives, 1);
        assert_eq!(gt.precision, Some(1.0));
        assert_eq!(gt.recall, Some(0.5));
        assert!((gt.f1.unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(gt.pair_completeness, Some(1.0));
        assert_eq!(summary.predicted_links, 1);
        assert_eq!(summary.label_counts, LabelCounts { matches: 1, review: 0, non_match: 2 });
    }

    #[test]
    fn undefined_ratios_are_none() {
        let mut fx = fixture();
        fx.clusters.clear();
        let empty: Vec<(String, String)> = Vec::new();
        let summary = run(&fx, Some(empty.as_slice()));
        let gt = summary.ground_truth.unwrap();
        assert_eq!(gt.precision, None);
        assert_eq!(gt.recall, None);
        assert_eq!(gt.f1, None);
        assert!(run(&fx, None).ground_truth.is_none());
    }

    #[test]
    fn bins_skip_negligible_posteriors() {
        let summary = run(&fixture(), None);
        assert_eq!(summary.posterior_bins.len(), 10);
        let counts: Vec<usize> = summary.posterior_bins.iter().map(|b| b.pairs).collect();
        assert_eq!(counts, vec![0, 0, 0, 0, 1, 0, 0, 0, 0, 1]);

        let top = &summary.posterior_bins[9];
        assert_eq!(top.fields[0].mean_distance, Some(0.0));
        let mid = &summary.posterior_bins[4];
        assert_eq!(mid.fields[0].mean_distance, Some(1.0));
        assert_eq!(mid.fields[1].mean_distance, Some(2.0));
        assert!(summary.agreement_tightens["name"]);
        assert!(summary.agreement_tightens["year"]);
    }

    #[test]
    fn sweep_counts_fall_with_threshold() {
        let summary = run(&fixture(), None);
        let sweep = &summary.threshold_sweep;
        assert_eq!(sweep.len(), 101);
        assert_eq!(sweep[0].matches, 3);
        assert_eq!(sweep[50].matches, 1);
        assert_eq!(sweep[100].threshold, 1.0);
        assert_eq!(sweep[100].matches, 0);
        assert!(sweep.windows(2).all(|w| w[1].matches <= w[0].matches));
    }

    #[test]
    fn sweep_ends_at_one_when_step_does_not_divide_it() {
        let sweep = threshold_sweep(&fixture().decisions, 0.3);
        assert_eq!(sweep.len(), 5);
        assert!((sweep[3].threshold - 0.9).abs() < 1e-12);
        assert_eq!(sweep[4].threshold, 1.0);
        let matches: Vec<usize> = sweep.iter().map(|p| p.matches).collect();
        assert_eq!(matches, vec![3, 2, 1, 1, 0]);

        let whole = threshold_sweep(&fixture().decisions, 1.0);
        let thresholds: Vec<f64> = whole.iter().map(|p| p.threshold).collect();
        assert_eq!(thresholds, vec![0.0, 1.0]);
    }

    #[test]
    fn deterministic_baseline_is_reported() {
        assert_eq!(run(&fixture(), None).deterministic_matches, 1);
    }
}
