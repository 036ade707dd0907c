//! Resolver: turns accepted decisions into disjoint link clusters.
//!
//! One-to-one resolution is greedy over a total order: posterior desc,
//! aggregate field distance asc, A id asc, B id asc. A pair whose A or B
//! record is already claimed loses; it is demoted to `non_match` and logged
//! as a conflict naming the rule that separated it from the winner.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::config::{ResolutionMode, ResolverConfig};
use crate::error::LinkError;
use crate::model::{
    ClusterLink, ConflictEntry, LinkCluster, LinkDecision, LinkLabel, Resolution, Side, TieBreak,
};

#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub clusters: Vec<LinkCluster>,
    pub conflicts: Vec<ConflictEntry>,
}

/// Compare two decisions under the tiebreak chain; `Less` means `x` wins.
/// Also returns the rule that decided (the last one tried on a full tie).
pub fn rank(x: &LinkDecision, y: &LinkDecision) -> (Ordering, TieBreak) {
    let by_posterior = y.posterior.total_cmp(&x.posterior);
    if by_posterior != Ordering::Equal {
        return (by_posterior, TieBreak::HigherPosterior);
    }
    let by_distance = x.aggregate_distance.total_cmp(&y.aggregate_distance);
    if by_distance != Ordering::Equal {
        return (by_distance, TieBreak::LowerFieldDistance);
    }
    let by_id = x.a_id.cmp(&y.a_id).then_with(|| x.b_id.cmp(&y.b_id));
    (by_id, TieBreak::RecordIdOrder)
}

fn eligible(decision: &LinkDecision, config: &ResolverConfig) -> bool {
    match decision.label {
        LinkLabel::Match => true,
        LinkLabel::Review => config.include_review,
        LinkLabel::NonMatch => false,
    }
}

pub fn resolve(decisions: &mut [LinkDecision], config: &ResolverConfig) -> Result<Resolved, LinkError> {
    let resolved = match config.mode {
        ResolutionMode::OneToOne => one_to_one(decisions, config, false)?,
        ResolutionMode::StrictOneToOne => one_to_one(decisions, config, true)?,
        ResolutionMode::ManyToMany => many_to_many(decisions, config),
    };
    log::info!(
        "resolver: {} cluster(s), {} conflict(s)",
        resolved.clusters.len(),
        resolved.conflicts.len()
    );
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// One-to-one
// ---------------------------------------------------------------------------

struct Win {
    tiebreak: Option<TieBreak>,
    competitors: usize,
}

fn one_to_one(
    decisions: &mut [LinkDecision],
    config: &ResolverConfig,
    strict: bool,
) -> Result<Resolved, LinkError> {
    let mut order: Vec<usize> = (0..decisions.len()).filter(|&i| eligible(&decisions[i], config)).collect();
    order.sort_by(|&x, &y| rank(&decisions[x], &decisions[y]).0);

    let mut claimed_a: HashMap<String, usize> = HashMap::new();
    let mut claimed_b: HashMap<String, usize> = HashMap::new();
    let mut wins: BTreeMap<usize, Win> = BTreeMap::new();
    let mut losers: Vec<(usize, usize, Side)> = Vec::new();

    for idx in order {
        let d = &decisions[idx];
        let contested = match (claimed_a.get(&d.a_id), claimed_b.get(&d.b_id)) {
            (Some(&winner), _) => Some((winner, Side::A)),
            (None, Some(&winner)) => Some((winner, Side::B)),
            (None, None) => None,
        };
        match contested {
            None => {
                claimed_a.insert(d.a_id.clone(), idx);
                claimed_b.insert(d.b_id.clone(), idx);
                wins.insert(idx, Win { tiebreak: None, competitors: 0 });
            }
            Some((winner, side)) => losers.push((idx, winner, side)),
        }
    }

    let mut conflicts = Vec::with_capacity(losers.len());
    for (loser, winner, side) in losers {
        let (ordering, reason) = rank(&decisions[winner], &decisions[loser]);
        if strict && ordering == Ordering::Equal {
            let (w, l) = (&decisions[winner], &decisions[loser]);
            return Err(LinkError::AmbiguousResolution {
                a_id: w.a_id.clone(),
                b_id: w.b_id.clone(),
                other_a_id: l.a_id.clone(),
                other_b_id: l.b_id.clone(),
            });
        }
        if let Some(win) = wins.get_mut(&winner) {
            win.competitors += 1;
            win.tiebreak.get_or_insert(reason);
        }

        let w = &decisions[winner];
        let l = &decisions[loser];
        log::debug!(
            "resolver: ({}, {}) loses to ({}, {}) on {:?}",
            l.a_id,
            l.b_id,
            w.a_id,
            w.b_id,
            reason
        );
        conflicts.push(ConflictEntry {
            a_id: l.a_id.clone(),
            b_id: l.b_id.clone(),
            posterior: l.posterior,
            contested_side: side,
            contested_id: match side {
                Side::A => l.a_id.clone(),
                Side::B => l.b_id.clone(),
            },
            winner_a_id: w.a_id.clone(),
            winner_b_id: w.b_id.clone(),
            winner_posterior: w.posterior,
            reason,
        });

        let l = &mut decisions[loser];
        l.label = LinkLabel::NonMatch;
        l.demoted = true;
    }
    conflicts.sort_by(|x, y| (&x.a_id, &x.b_id).cmp(&(&y.a_id, &y.b_id)));

    let mut clusters: Vec<LinkCluster> = wins
        .into_iter()
        .map(|(idx, win)| {
            let d = &decisions[idx];
            LinkCluster {
                cluster_id: 0,
                a_ids: vec![d.a_id.clone()],
                b_ids: vec![d.b_id.clone()],
                links: vec![ClusterLink { a_id: d.a_id.clone(), b_id: d.b_id.clone(), posterior: d.posterior }],
                posterior: d.posterior,
                resolution: Resolution { tiebreak: win.tiebreak, competitors: win.competitors },
            }
        })
        .collect();
    number_clusters(&mut clusters);

    Ok(Resolved { clusters, conflicts })
}

// ---------------------------------------------------------------------------
// Many-to-many
// ---------------------------------------------------------------------------

/// Disjoint-set forest over record nodes.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, x: usize, y: usize) {
        let (rx, ry) = (self.find(x), self.find(y));
        if rx != ry {
            // Smaller root wins so component roots do not depend on edge order.
            let (keep, merge) = if rx < ry { (rx, ry) } else { (ry, rx) };
            self.parent[merge] = keep;
        }
    }
}

fn many_to_many(decisions: &[LinkDecision], config: &ResolverConfig) -> Resolved {
    let accepted: Vec<&LinkDecision> = decisions.iter().filter(|d| eligible(d, config)).collect();

    let mut nodes: BTreeMap<(Side, &str), usize> = BTreeMap::new();
    for d in &accepted {
        let next = nodes.len();
        nodes.entry((Side::A, d.a_id.as_str())).or_insert(next);
        let next = nodes.len();
        nodes.entry((Side::B, d.b_id.as_str())).or_insert(next);
    }

    let mut forest = UnionFind::new(nodes.len());
    for d in &accepted {
        forest.union(nodes[&(Side::A, d.a_id.as_str())], nodes[&(Side::B, d.b_id.as_str())]);
    }

    let mut groups: BTreeMap<usize, Vec<&LinkDecision>> = BTreeMap::new();
    for d in &accepted {
        let root = forest.find(nodes[&(Side::A, d.a_id.as_str())]);
        groups.entry(root).or_default().push(d);
    }

    let mut clusters: Vec<LinkCluster> = groups
        .into_values()
        .map(|mut links| {
            links.sort_by(|x, y| (&x.a_id, &x.b_id).cmp(&(&y.a_id, &y.b_id)));
            let mut a_ids: Vec<String> = links.iter().map(|d| d.a_id.clone()).collect();
            let mut b_ids: Vec<String> = links.iter().map(|d| d.b_id.clone()).collect();
            a_ids.sort();
            a_ids.dedup();
            b_ids.sort();
            b_ids.dedup();
            let posterior = links.iter().map(|d| d.posterior).fold(f64::INFINITY, f64::min);
            LinkCluster {
                cluster_id: 0,
                a_ids,
                b_ids,
                links: links
                    .iter()
                    .map(|d| ClusterLink { a_id: d.a_id.clone(), b_id: d.b_id.clone(), posterior: d.posterior })
                    .collect(),
                posterior,
                resolution: Resolution { tiebreak: None, competitors: 0 },
            }
        })
        .collect();
    number_clusters(&mut clusters);

    Resolved { clusters, conflicts: Vec::new() }
}

/// Order clusters by (first A id, first B id) and number them from 0.
fn number_clusters(clusters: &mut [LinkCluster]) {
    clusters.sort_by(|x, y| (x.a_ids.first(), x.b_ids.first()).cmp(&(y.a_ids.first(), y.b_ids.first())));
    for (i, cluster) in clusters.iter_mut().enumerate() {
        cluster.cluster_id = i;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn decision(a: &str, b: &str, posterior: f64, distance: f64) -> LinkDecision {
        LinkDecision {
            a_id: a.into(),
            b_id: b.into(),
            log_likelihood_ratio: 0.0,
            match_weight: 0.0,
            posterior,
            label: if posterior >= 0.9 { LinkLabel::Match } else if posterior <= 0.5 { LinkLabel::NonMatch } else { LinkLabel::Review },
            demoted: false,
            aggregate_distance: distance,
        }
    }

    fn config(mode: ResolutionMode) -> ResolverConfig {
        ResolverConfig { mode, include_review: false }
    }

    #[test]
    fn higher_posterior_wins() {
        let mut ds = vec![
            decision("5", "5", 0.99, 0.0),
            decision("5", "11", 0.95, 0.5),
            decision("1", "1", 0.99, 0.0),
        ];
        let out = resolve(&mut ds, &config(ResolutionMode::OneToOne)).unwrap();
        assert_eq!(out.clusters.len(), 2);
        assert_eq!(out.clusters[0].a_ids, vec!["1".to_string()]);
        assert_eq!(out.clusters[1].b_ids, vec!["5".to_string()]);
        assert_eq!(out.clusters[1].resolution.tiebreak, Some(TieBreak::HigherPosterior));
        assert_eq!(out.clusters[1].resolution.competitors, 1);
        assert_eq!(out.clusters[0].resolution.tiebreak, None);

        assert_eq!(out.conflicts.len(), 1);
        let c = &out.conflicts[0];
        assert_eq!((c.a_id.as_str(), c.b_id.as_str()), ("5", "11"));
        assert_eq!(c.contested_side, Side::A);
        assert_eq!(c.contested_id, "5");
        assert_eq!(c.winner_b_id, "5");
        assert_eq!(c.reason, TieBreak::HigherPosterior);

        assert!(ds[1].demoted);
        assert_eq!(ds[1].label, LinkLabel::NonMatch);
        assert!(!ds[0].demoted);
    }

    #[test]
    fn equal_posterior_falls_back_to_distance_then_ids() {
        let mut ds = vec![decision("1", "b", 0.95, 0.3), decision("1", "a", 0.95, 0.1)];
        let out = resolve(&mut ds, &config(ResolutionMode::OneToOne)).unwrap();
        assert_eq!(out.clusters[0].b_ids, vec!["a".to_string()]);
        assert_eq!(out.conflicts[0].reason, TieBreak::LowerFieldDistance);

        let mut ds = vec![decision("2", "x", 0.95, 0.2), decision("1", "x", 0.95, 0.2)];
        let out = resolve(&mut ds, &config(ResolutionMode::OneToOne)).unwrap();
        assert_eq!(out.clusters[0].a_ids, vec!["1".to_string()]);
        assert_eq!(out.conflicts[0].reason, TieBreak::RecordIdOrder);
        assert_eq!(out.conflicts[0].contested_side, Side::B);
    }

    #[test]
    fn review_is_eligible_only_on_request() {
        let mut ds = vec![decision("1", "1", 0.7, 0.0)];
        let out = resolve(&mut ds, &config(ResolutionMode::OneToOne)).unwrap();
        assert!(out.clusters.is_empty());

        let cfg = ResolverConfig { mode: ResolutionMode::OneToOne, include_review: true };
        let out = resolve(&mut ds, &cfg).unwrap();
        assert_eq!(out.clusters.len(), 1);
    }

    #[test]
    fn strict_mode_accepts_distinct_pairs() {
        let mut ds = vec![
            decision("1", "1", 0.95, 0.1),
            decision("1", "2", 0.95, 0.1),
            decision("2", "1", 0.95, 0.1),
        ];
        let out = resolve(&mut ds, &config(ResolutionMode::StrictOneToOne)).unwrap();
        assert_eq!(out.clusters.len(), 1);
        assert_eq!(out.conflicts.len(), 2);
        assert!(out.conflicts.iter().all(|c| c.reason == TieBreak::RecordIdOrder));
    }

    #[test]
    fn strict_mode_rejects_indistinguishable_links() {
        let mut ds = vec![decision("1", "1", 0.95, 0.1), decision("1", "1", 0.95, 0.1)];
        let err = resolve(&mut ds, &config(ResolutionMode::StrictOneToOne)).unwrap_err();
        assert!(matches!(err, LinkError::AmbiguousResolution { .. }));

        let mut ds = vec![decision("1", "1", 0.95, 0.1), decision("1", "1", 0.95, 0.1)];
        assert!(resolve(&mut ds, &config(ResolutionMode::OneToOne)).is_ok());
    }

    #[test]
    fn many_to_many_groups_components() {
        let mut ds = vec![
            decision("1", "a", 0.99, 0.0),
            decision("1", "b", 0.97, 0.0),
            decision("2", "b", 0.95, 0.0),
            decision("3", "c", 0.92, 0.0),
            decision("4", "d", 0.1, 0.0),
        ];
        let out = resolve(&mut ds, &config(ResolutionMode::ManyToMany)).unwrap();
        assert_eq!(out.clusters.len(), 2);
        assert_eq!(out.clusters[0].a_ids, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(out.clusters[0].b_ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(out.clusters[0].links.len(), 3);
        assert_eq!(out.clusters[0].posterior, 0.95);
        assert_eq!(out.clusters[1].cluster_id, 1);
        assert!(out.conflicts.is_empty());
        assert!(ds.iter().all(|d| !d.demoted));
    }

    #[test]
    fn one_to_one_clusters_are_disjoint() {
        let mut ds = Vec::new();
        for a in 0..6 {
            for b in 0..6 {
                let posterior = 0.9 + ((a * 7 + b * 3) % 10) as f64 / 100.0;
                ds.push(decision(&a.to_string(), &b.to_string(), posterior, ((a + b) % 4) as f64));
            }
        }
        let out = resolve(&mut ds, &config(ResolutionMode::StrictOneToOne)).unwrap();
        let mut seen = HashSet::new();
        for cluster in &out.clusters {
            for id in &cluster.a_ids {
                assert!(seen.insert(format!("A:{id}")));
            }
            for id in &cluster.b_ids {
                assert!(seen.insert(format!("B:{id}")));
            }
        }
        let linked = ds.iter().filter(|d| d.label == LinkLabel::Match).count();
        assert_eq!(linked, out.clusters.len());
        assert_eq!(out.conflicts.len() + out.clusters.len(), 36);
    }
}
