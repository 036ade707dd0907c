//! Blocker: partitions both record sets by cheap keys and emits candidate pairs.
//!
//! Key invariants:
//! - Rules are OR-ed: a pair is a candidate if it shares a key under any rule
//! - Every emitted pair shares at least one key (the catch-all key counts)
//! - Records with no key under any rule go to the catch-all bucket, which is
//!   bounded by `catch_all_cap`; overflow is truncated and reported
//! - Output order is deterministic: pairs sorted by (a index, b index)

use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;
use serde::Serialize;

use crate::config::{BlockingRule, KeyPart, LinkConfig};
use crate::error::LinkWarning;
use crate::model::{CandidatePair, FieldValue, Record};

/// Key shared by every record that has no key under any rule.
pub const CATCH_ALL_KEY: &str = "*";

type Buckets = HashMap<String, Vec<usize>>;

#[derive(Debug, Clone, Serialize)]
pub struct RuleStats {
    pub name: String,
    /// Keys present on both sides.
    pub shared_buckets: usize,
    /// Pairs produced by this rule alone, before the union.
    pub pairs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockingStats {
    pub rules: Vec<RuleStats>,
    pub candidate_pairs: usize,
    pub catch_all_a: usize,
    pub catch_all_b: usize,
    pub catch_all_pairs: usize,
    pub dropped_pairs: usize,
    /// Size of the full A × B comparison space.
    pub full_comparison_space: usize,
    /// `1 - candidate_pairs / full_comparison_space`
    pub reduction_ratio: f64,
}

#[derive(Debug)]
pub struct Blocking {
    pub pairs: Vec<CandidatePair>,
    pub stats: BlockingStats,
    pub warnings: Vec<LinkWarning>,
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// All block keys of a record, one per rule that can be computed.
pub fn record_keys(record: &Record, rules: &[BlockingRule]) -> Vec<String> {
    rules.iter().filter_map(|rule| rule_key(record, rule)).collect()
}

/// `"<rule>:<part>|<part>"`, or `None` when any part is missing.
pub fn rule_key(record: &Record, rule: &BlockingRule) -> Option<String> {
    let mut parts = Vec::with_capacity(rule.parts.len());
    for part in &rule.parts {
        parts.push(part_key(record.value(part.field()), part)?);
    }
    Some(format!("{}:{}", rule.name, parts.join("|")))
}

fn part_key(value: &FieldValue, part: &KeyPart) -> Option<String> {
    if value.is_missing() {
        return None;
    }
    match part {
        KeyPart::Exact { .. } => Some(value.render()),
        KeyPart::Initial { .. } => value.render().chars().next().map(String::from),
        KeyPart::Prefix { length, .. } => Some(value.render().chars().take(*length).collect()),
        KeyPart::Soundex { .. } => soundex(&value.render()),
        KeyPart::Bucket { width, .. } => {
            let x = match value {
                FieldValue::Date(d) => chrono::Datelike::year(d) as f64,
                other => other.as_number()?,
            };
            Some(format!("{}", (x / width).floor() as i64))
        }
    }
}

/// American Soundex (letter + three digits). `None` if the value has no ASCII letter.
pub fn soundex(s: &str) -> Option<String> {
    fn code(c: char) -> Option<char> {
        match c {
            'b' | 'f' | 'p' | 'v' => Some('1'),
            'c' | 'g' | 'j' | 'k' | 'q' | 's' | 'x' | 'z' => Some('2'),
            'd' | 't' => Some('3'),
            'l' => Some('4'),
            'm' | 'n' => Some('5'),
            'r' => Some('6'),
            _ => None,
        }
    }

    let mut letters = s.chars().filter(|c| c.is_ascii_alphabetic()).map(|c| c.to_ascii_lowercase());
    let first = letters.next()?;
    let mut out = String::with_capacity(4);
    out.push(first.to_ascii_uppercase());

    let mut last = code(first);
    for c in letters {
        if out.len() == 4 {
            break;
        }
        // h and w do not separate equal codes; vowels do
        if c == 'h' || c == 'w' {
            continue;
        }
        let current = code(c);
        if let Some(digit) = current {
            if current != last {
                out.push(digit);
            }
        }
        last = current;
    }
    while out.len() < 4 {
        out.push('0');
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

/// Populate buckets in parallel shards, merged once, with sorted member lists.
fn build_buckets(keys: &[Vec<String>]) -> Buckets {
    let mut buckets = keys
        .par_iter()
        .enumerate()
        .fold(Buckets::new, |mut shard, (idx, record_keys)| {
            for key in record_keys {
                shard.entry(key.clone()).or_default().push(idx);
            }
            shard
        })
        .reduce(Buckets::new, merge_shards);

    for members in buckets.values_mut() {
        members.sort_unstable();
    }
    buckets
}

fn merge_shards(mut left: Buckets, right: Buckets) -> Buckets {
    for (key, members) in right {
        left.entry(key).or_default().extend(members);
    }
    left
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn block(a: &[Record], b: &[Record], config: &LinkConfig) -> Blocking {
    let rules = &config.blocking;

    let keys_a: Vec<Vec<String>> = a.par_iter().map(|r| record_keys(r, rules)).collect();
    let keys_b: Vec<Vec<String>> = b.par_iter().map(|r| record_keys(r, rules)).collect();

    let buckets_a = build_buckets(&keys_a);
    let buckets_b = build_buckets(&keys_b);

    let mut candidates: BTreeMap<(usize, usize), Vec<String>> = BTreeMap::new();
    let mut rule_stats: Vec<RuleStats> = rules
        .iter()
        .map(|r| RuleStats { name: r.name.clone(), shared_buckets: 0, pairs: 0 })
        .collect();

    // Sorted key order keeps key lists on each pair deterministic.
    let mut shared: Vec<(&String, &Vec<usize>, &Vec<usize>)> = buckets_a
        .iter()
        .filter_map(|(key, members_a)| buckets_b.get(key).map(|members_b| (key, members_a, members_b)))
        .collect();
    shared.sort_unstable_by(|x, y| x.0.cmp(y.0));

    for (key, members_a, members_b) in shared {
        let rule = key.split_once(':').map(|(rule, _)| rule);
        if let Some(stats) = rule_stats.iter_mut().find(|s| Some(s.name.as_str()) == rule) {
            stats.shared_buckets += 1;
            stats.pairs += members_a.len() * members_b.len();
        }
        for &ia in members_a {
            for &ib in members_b {
                candidates.entry((ia, ib)).or_default().push(key.clone());
            }
        }
    }

    // Catch-all: keyless records meet every record of the other side, up to the cap.
    // Keyless records sit in no bucket, so catch-all pairs never overlap blocked ones;
    // a pair keyless on both sides is offered once, from the A side.
    let keyless_a: Vec<usize> = (0..a.len()).filter(|&i| keys_a[i].is_empty()).collect();
    let keyless_b: Vec<usize> = (0..b.len()).filter(|&i| keys_b[i].is_empty()).collect();
    let cap = config.catch_all_cap;
    let catch_all_space =
        keyless_a.len() * b.len() + keyless_b.len() * a.len() - keyless_a.len() * keyless_b.len();

    let a_keys = &keys_a;
    let offered = keyless_a
        .iter()
        .flat_map(|&ia| (0..b.len()).map(move |ib| (ia, ib)))
        .chain(keyless_b.iter().flat_map(move |&ib| {
            (0..a.len()).filter(move |&ia| !a_keys[ia].is_empty()).map(move |ia| (ia, ib))
        }));
    let mut catch_all_pairs = 0usize;
    for pair in offered.take(cap) {
        candidates.insert(pair, vec![CATCH_ALL_KEY.to_string()]);
        catch_all_pairs += 1;
    }
    let dropped_pairs = catch_all_space - catch_all_pairs;

    let mut warnings = Vec::new();
    if dropped_pairs > 0 {
        log::warn!(
            "catch-all bucket exceeded cap of {cap} pairs: dropped {dropped_pairs} candidate pair(s) from {} + {} keyless record(s)",
            keyless_a.len(),
            keyless_b.len()
        );
        warnings.push(LinkWarning::BlockingOverflow { cap, dropped: dropped_pairs });
    }

    let pairs: Vec<CandidatePair> = candidates
        .into_iter()
        .map(|((a, b), block_keys)| CandidatePair { a, b, block_keys })
        .collect();

    let full = a.len() * b.len();
    let reduction_ratio = if full == 0 { 0.0 } else { 1.0 - pairs.len() as f64 / full as f64 };

    log::info!(
        "blocking: {} candidate pair(s) from {} x {} records ({} catch-all, reduction {:.4})",
        pairs.len(),
        a.len(),
        b.len(),
        catch_all_pairs,
        reduction_ratio
    );

    Blocking {
        stats: BlockingStats {
            rules: rule_stats,
            candidate_pairs: pairs.len(),
            catch_all_a: keyless_a.len(),
            catch_all_b: keyless_b.len(),
            catch_all_pairs,
            dropped_pairs,
            full_comparison_space: full,
            reduction_ratio,
        },
        pairs,
        warnings,
    }
}
