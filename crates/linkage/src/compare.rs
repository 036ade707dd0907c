//! Comparator: turns a candidate pair into a vector of discrete agreement levels.
//!
//! Every metric yields a similarity in [0, 1]. With K descending thresholds
//! `t_0 > t_1 > ... > t_{K-1}`, a similarity `s` maps to level `K - i` for the
//! first `i` with `s >= t_i`, and to level 0 (disagree) otherwise. A slot is
//! `None` when either side is missing.

use rayon::prelude::*;

use crate::config::{LinkConfig, Metric};
use crate::model::{CandidatePair, ComparisonVector, FieldValue, Record};

/// Per-field comparison plan, laid out in comparison-vector order.
#[derive(Debug, Clone)]
struct Slot {
    field: String,
    metric: Metric,
    thresholds: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct Comparator {
    slots: Vec<Slot>,
}

impl Comparator {
    pub fn new(config: &LinkConfig) -> Self {
        let slots = config
            .compared_fields()
            .into_iter()
            .filter_map(|f| {
                f.metric.clone().map(|metric| Slot {
                    field: f.name.clone(),
                    metric,
                    thresholds: f.thresholds(),
                })
            })
            .collect();
        Self { slots }
    }

    /// Field names in comparison-vector order.
    pub fn fields(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.field.as_str()).collect()
    }

    /// Level counts per slot (thresholds + 1).
    pub fn level_counts(&self) -> Vec<usize> {
        self.slots.iter().map(|s| s.thresholds.len() + 1).collect()
    }

    pub fn compare(&self, a: &Record, b: &Record) -> ComparisonVector {
        let mut levels = Vec::with_capacity(self.slots.len());
        let mut similarities = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let sim = similarity(&slot.metric, a.value(&slot.field), b.value(&slot.field));
            levels.push(sim.map(|s| level(s, &slot.thresholds)));
            similarities.push(sim);
        }
        ComparisonVector { levels, similarities }
    }

    /// Compare every candidate pair. Output is index-aligned with `pairs`.
    pub fn compare_pairs(&self, a: &[Record], b: &[Record], pairs: &[CandidatePair]) -> Vec<ComparisonVector> {
        let vectors: Vec<ComparisonVector> =
            pairs.par_iter().map(|p| self.compare(&a[p.a], &b[p.b])).collect();
        log::debug!("compared {} candidate pair(s) across {} field(s)", vectors.len(), self.slots.len());
        vectors
    }
}

/// Map a similarity onto an agreement level.
pub fn level(similarity: f64, thresholds: &[f64]) -> u8 {
    let k = thresholds.len();
    thresholds
        .iter()
        .position(|t| similarity >= *t)
        .map(|i| (k - i) as u8)
        .unwrap_or(0)
}

/// Similarity of two field values under a metric, or `None` if incomparable.
pub fn similarity(metric: &Metric, a: &FieldValue, b: &FieldValue) -> Option<f64> {
    if a.is_missing() || b.is_missing() {
        return None;
    }
    match metric {
        Metric::Exact => Some(if a == b { 1.0 } else { 0.0 }),
        Metric::Levenshtein => {
            let (x, y) = (a.as_text()?, b.as_text()?);
            Some(strsim::normalized_levenshtein(x, y))
        }
        Metric::JaroWinkler => {
            let (x, y) = (a.as_text()?, b.as_text()?);
            Some(strsim::jaro_winkler(x, y))
        }
        Metric::Prefix => {
            let (x, y) = (a.as_text()?, b.as_text()?);
            Some(prefix_similarity(x, y))
        }
        Metric::AbsDiff { scale } => {
            let d = numeric_distance(a, b)?;
            Some(1.0 / (1.0 + d / scale))
        }
        Metric::Gauss { offset, scale } => {
            let d = (numeric_distance(a, b)? - offset).max(0.0);
            Some(2f64.powf(-(d / scale).powi(2)))
        }
        Metric::Linear { offset, scale } => {
            let d = (numeric_distance(a, b)? - offset).max(0.0);
            Some((1.0 - d / (2.0 * scale)).max(0.0))
        }
    }
}

/// Absolute difference of two numeric (or date) values.
pub fn numeric_distance(a: &FieldValue, b: &FieldValue) -> Option<f64> {
    Some((a.as_number()? - b.as_number()?).abs())
}

fn prefix_similarity(x: &str, y: &str) -> f64 {
    let longest = x.chars().count().max(y.chars().count());
    if longest == 0 {
        return 1.0;
    }
    let common = x.chars().zip(y.chars()).take_while(|(p, q)| p == q).count();
    common as f64 / longest as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RawRecord, Side};
    use crate::normalize::normalize_records;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    const CONFIG: &str = r#"
name = "t"

[[fields]]
name = "firstname"
type = "string"
metric = { kind = "jaro_winkler" }

[[fields]]
name = "zipcode"
type = "categorical"

[[fields]]
name = "birthyear"
type = "numeric"
metric = { kind = "abs_diff", scale = 1.0 }
levels = [1.0, 0.5]

[[fields]]
name = "city"
type = "categorical"
metric = { kind = "exact" }
"#;

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.into())
    }

    #[test]
    fn levels_follow_thresholds() {
        let t = [0.95, 0.85];
        assert_eq!(level(1.0, &t), 2);
        assert_eq!(level(0.95, &t), 2);
        assert_eq!(level(0.9, &t), 1);
        assert_eq!(level(0.5, &t), 0);
        assert_eq!(level(1.0, &[1.0]), 1);
        assert_eq!(level(0.99, &[1.0]), 0);
    }

    #[test]
    fn numeric_metrics() {
        let (x, y) = (FieldValue::Number(1980.0), FieldValue::Number(1982.0));
        let abs = similarity(&Metric::AbsDiff { scale: 1.0 }, &x, &y).unwrap();
        assert!((abs - 1.0 / 3.0).abs() < 1e-12);
        let gauss = similarity(&Metric::Gauss { offset: 0.0, scale: 2.0 }, &x, &y).unwrap();
        assert!((gauss - 0.5).abs() < 1e-12);
        let linear = similarity(&Metric::Linear { offset: 1.0, scale: 1.0 }, &x, &y).unwrap();
        assert!((linear - 0.5).abs() < 1e-12);
        let far = similarity(&Metric::Linear { offset: 0.0, scale: 1.0 }, &x, &FieldValue::Number(2000.0));
        assert_eq!(far, Some(0.0));
    }

    #[test]
    fn dates_compare_in_days() {
        let x = FieldValue::Date(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        let y = FieldValue::Date(NaiveDate::from_ymd_opt(2020, 1, 3).unwrap());
        assert_eq!(numeric_distance(&x, &y), Some(2.0));
    }

    #[test]
    fn text_metrics() {
        assert_eq!(similarity(&Metric::JaroWinkler, &text("smith"), &text("smith")), Some(1.0));
        let jw = similarity(&Metric::JaroWinkler, &text("johnson"), &text("johnsen")).unwrap();
        assert!(jw > 0.9 && jw < 1.0);
        let lev = similarity(&Metric::Levenshtein, &text("kitten"), &text("sitting")).unwrap();
        assert!((lev - (1.0 - 3.0 / 7.0)).abs() < 1e-12);
        let pre = similarity(&Metric::Prefix, &text("john"), &text("johnny")).unwrap();
        assert!((pre - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn missing_is_incomparable() {
        assert_eq!(similarity(&Metric::Exact, &FieldValue::Missing, &text("a")), None);
        assert_eq!(similarity(&Metric::JaroWinkler, &text("a"), &FieldValue::Missing), None);
    }

    #[test]
    fn vector_shape_matches_compared_fields() {
        let config = LinkConfig::from_toml(CONFIG).unwrap();
        let a = normalize_records(
            Side::A,
            &[RawRecord::new("1", [("firstname", "John"), ("zipcode", "1"), ("birthyear", "1980"), ("city", "")])],
            &config,
        )
        .unwrap()
        .records;
        let b = normalize_records(
            Side::B,
            &[RawRecord::new("1", [("firstname", "Jon"), ("zipcode", "2"), ("birthyear", "1981"), ("city", "Oslo")])],
            &config,
        )
        .unwrap()
        .records;

        let comparator = Comparator::new(&config);
        assert_eq!(comparator.fields(), vec!["firstname", "birthyear", "city"]);
        assert_eq!(comparator.level_counts(), vec![3, 3, 2]);

        let pairs = vec![CandidatePair { a: 0, b: 0, block_keys: vec!["*".into()] }];
        let vectors = comparator.compare_pairs(&a, &b, &pairs);
        assert_eq!(vectors.len(), 1);
        let v = &vectors[0];
        assert_eq!(v.len(), 3);
        assert_eq!(v.levels[1], Some(1));
        assert_eq!(v.levels[2], None);
        assert!(v.similarities[0].unwrap() > 0.85);
    }

    proptest! {
        #[test]
        fn similarities_stay_in_unit_interval(x in "[a-z]{1,12}", y in "[a-z]{1,12}", p in -1e6f64..1e6, q in -1e6f64..1e6) {
            for metric in [Metric::Exact, Metric::Levenshtein, Metric::JaroWinkler, Metric::Prefix] {
                let s = similarity(&metric, &text(&x), &text(&y)).unwrap();
                prop_assert!((0.0..=1.0).contains(&s));
            }
            let numeric = [
                Metric::AbsDiff { scale: 3.0 },
                Metric::Gauss { offset: 1.0, scale: 2.0 },
                Metric::Linear { offset: 0.0, scale: 5.0 },
            ];
            for metric in numeric {
                let s = similarity(&metric, &FieldValue::Number(p), &FieldValue::Number(q)).unwrap();
                prop_assert!((0.0..=1.0).contains(&s));
            }
        }

        #[test]
        fn identical_values_reach_top_level(x in "[a-z]{1,12}") {
            let t = [0.95, 0.85];
            let s = similarity(&Metric::JaroWinkler, &text(&x), &text(&x)).unwrap();
            prop_assert_eq!(level(s, &t), 2);
        }
    }
}
