//! Second-pass controller
//!
//! Nodes implicated in a failed first-pass unit are retested next to nodes
//! known to be healthy. A node that fails again is failed for good; a node
//! that passes is cleared. There is no third pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use rand::seq::{IteratorRandom, SliceRandom};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::node::{Node, Topology};
use crate::pairing::{Pass, PairingStrategy, TestUnit};

/// How a partner domain is chosen when several passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecondPassPolicy {
    /// Any passed domain, uniformly at random
    #[default]
    UniformRandom,
    /// The lowest-sorted passed domain
    First,
}

impl fmt::Display for SecondPassPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecondPassPolicy::UniformRandom => f.write_str("uniform_random"),
            SecondPassPolicy::First => f.write_str("first"),
        }
    }
}

impl FromStr for SecondPassPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "uniform_random" | "random" => Ok(SecondPassPolicy::UniformRandom),
            "first" => Ok(SecondPassPolicy::First),
            other => Err(format!("unknown second pass policy: {other}")),
        }
    }
}

/// A node that recently passed and may serve as a reference partner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthyNode {
    pub name: String,
    pub topology: Topology,
    /// Epoch seconds of the passing run
    pub passed_at: i64,
}

impl HealthyNode {
    pub fn new(name: impl Into<String>, topology: Topology, passed_at: i64) -> Self {
        Self {
            name: name.into(),
            topology,
            passed_at,
        }
    }
}

/// Units formed for the second pass
#[derive(Debug, Clone, Default)]
pub struct SecondPassPlan {
    pub units: Vec<TestUnit>,
    /// Implicated nodes that found no partner this round. They keep their
    /// marker and are retried on the next tick.
    pub deferred: Vec<String>,
}

/// Only first-pass units may lead to a second pass
pub fn leads_to_second_pass(unit: &TestUnit) -> bool {
    unit.pass == Pass::First
}

#[derive(Debug, Clone)]
pub struct SecondPassController {
    strategy: PairingStrategy,
    group_size: usize,
    policy: SecondPassPolicy,
}

impl SecondPassController {
    pub fn new(strategy: PairingStrategy, group_size: usize, policy: SecondPassPolicy) -> Self {
        Self {
            strategy,
            group_size,
            policy,
        }
    }

    /// Whether disambiguation is possible at all
    pub fn is_applicable(&self) -> bool {
        self.group_size >= 2
    }

    /// Order the healthy pool most recent first; ties are broken at random
    pub fn rank_healthy<R: Rng + ?Sized>(&self, mut healthy: Vec<HealthyNode>, rng: &mut R) -> Vec<HealthyNode> {
        healthy.sort_by(|a, b| a.name.cmp(&b.name));
        healthy.dedup_by(|a, b| a.name == b.name);
        healthy.shuffle(rng);
        healthy.sort_by(|a, b| b.passed_at.cmp(&a.passed_at));
        healthy
    }

    /// Pair each implicated node with `g - 1` healthy partners.
    ///
    /// Every healthy node is used at most once. Partners must sit in a domain
    /// that contains no implicated node when the strategy pairs across
    /// domains.
    pub fn plan<R: Rng + ?Sized>(
        &self,
        implicated: &[Node],
        healthy: Vec<HealthyNode>,
        rng: &mut R,
        now: i64,
        ttl_secs: i64,
    ) -> SecondPassPlan {
        let mut plan = SecondPassPlan::default();
        if implicated.is_empty() {
            return plan;
        }

        let implicated_names: BTreeSet<&str> = implicated.iter().map(|n| n.name.as_str()).collect();
        let failed_domains: BTreeSet<String> = implicated
            .iter()
            .filter_map(|n| self.strategy.domain_of(&n.topology))
            .collect();

        let mut pool: Vec<HealthyNode> = self
            .rank_healthy(healthy, rng)
            .into_iter()
            .filter(|h| !implicated_names.contains(h.name.as_str()))
            .collect();

        let mut targets: Vec<&Node> = implicated.iter().collect();
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        targets.dedup_by(|a, b| a.name == b.name);
        targets.shuffle(rng);

        let needed = self.group_size.saturating_sub(1);
        for target in targets {
            let mut partners = Vec::with_capacity(needed);
            for _ in 0..needed {
                match self.pick_partner(target, &pool, &failed_domains, &partners, rng) {
                    Some(idx) => partners.push(pool.remove(idx)),
                    None => break,
                }
            }

            if partners.len() < needed || needed == 0 {
                // Return partners to the pool in their ranked position
                for partner in partners {
                    let pos = pool
                        .iter()
                        .position(|h| h.passed_at < partner.passed_at)
                        .unwrap_or(pool.len());
                    pool.insert(pos, partner);
                }
                debug!(node = %target.name, "No healthy partner available for second pass");
                plan.deferred.push(target.name.clone());
                continue;
            }

            let mut nodes = vec![target.name.clone()];
            nodes.extend(partners.iter().map(|p| p.name.clone()));
            let unit = TestUnit::second_pass(
                nodes,
                vec![target.name.clone()],
                self.strategy,
                now,
                ttl_secs,
            );
            info!(
                unit = %unit.id,
                node = %target.name,
                partners = ?&unit.nodes[1..],
                "Formed second pass unit"
            );
            plan.units.push(unit);
        }
        plan
    }

    fn pick_partner<R: Rng + ?Sized>(
        &self,
        target: &Node,
        pool: &[HealthyNode],
        failed_domains: &BTreeSet<String>,
        chosen: &[HealthyNode],
        rng: &mut R,
    ) -> Option<usize> {
        match self.strategy {
            PairingStrategy::Random => (!pool.is_empty()).then_some(0),
            PairingStrategy::IntraRack => {
                let rack = self.strategy.domain_of(&target.topology);
                pool.iter()
                    .position(|h| self.strategy.domain_of(&h.topology) == rack)
                    .or_else(|| (!pool.is_empty()).then_some(0))
            }
            PairingStrategy::InterRack | PairingStrategy::InterCluster => {
                let same_cluster = |h: &HealthyNode| h.topology.cluster_id == target.topology.cluster_id;
                let taken: BTreeSet<String> = chosen
                    .iter()
                    .filter_map(|c| self.strategy.domain_of(&c.topology))
                    .collect();

                // Passed domains and the most recent candidate in each
                let mut domains: BTreeMap<String, usize> = BTreeMap::new();
                for (idx, healthy) in pool.iter().enumerate() {
                    if self.strategy == PairingStrategy::InterRack && !same_cluster(healthy) {
                        continue;
                    }
                    let Some(domain) = self.strategy.domain_of(&healthy.topology) else {
                        continue;
                    };
                    if failed_domains.contains(&domain) || taken.contains(&domain) {
                        continue;
                    }
                    domains.entry(domain).or_insert(idx);
                }

                match self.policy {
                    SecondPassPolicy::First => domains.values().next().copied(),
                    SecondPassPolicy::UniformRandom => domains.values().copied().choose(rng),
                }
            }
        }
    }
}

/// Final verdicts after both passes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CombinedVerdicts {
    pub passed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    /// First-pass failures still waiting for a second pass
    pub pending: BTreeSet<String>,
}

/// Merge first- and second-pass outcomes.
///
/// A first-pass pass is never demoted. A first-pass failure is confirmed or
/// cleared by its second pass; without one it stays pending.
pub fn combine_verdicts(
    first_passed: &BTreeSet<String>,
    first_failed: &BTreeSet<String>,
    second_passed: &BTreeSet<String>,
    second_failed: &BTreeSet<String>,
) -> CombinedVerdicts {
    let mut combined = CombinedVerdicts {
        passed: first_passed.clone(),
        ..Default::default()
    };

    for node in first_failed.iter().filter(|n| !first_passed.contains(*n)) {
        if second_passed.contains(node) {
            combined.passed.insert(node.clone());
        } else if second_failed.contains(node) {
            combined.failed.insert(node.clone());
        } else {
            combined.pending.insert(node.clone());
        }
    }

    // Second-pass results for nodes carried over from an earlier tick
    for node in second_passed.difference(first_failed) {
        if !first_passed.contains(node) {
            combined.passed.insert(node.clone());
        }
    }
    for node in second_failed.difference(first_failed) {
        if !first_passed.contains(node) {
            combined.failed.insert(node.clone());
        }
    }
    combined
}
