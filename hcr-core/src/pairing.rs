//! Pairing engine
//!
//! Groups candidate nodes into test units. Every strategy produces disjoint
//! groups of exactly `g` nodes; leftovers stay untouched until the next tick.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::{Node, Topology};

/// Domain name used for nodes without topology information
pub const UNKNOWN_DOMAIN: &str = "unknown";

/// How candidates are grouped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PairingStrategy {
    /// Shuffle and chunk
    #[default]
    Random,
    /// Only nodes of the same rack are grouped
    IntraRack,
    /// One node per rack, racks of the same cluster
    InterRack,
    /// One node per cluster
    InterCluster,
}

impl PairingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingStrategy::Random => "random",
            PairingStrategy::IntraRack => "intra_rack",
            PairingStrategy::InterRack => "inter_rack",
            PairingStrategy::InterCluster => "inter_cluster",
        }
    }

    /// Whether grouping depends on topology attributes
    pub fn is_topology_aware(&self) -> bool {
        !matches!(self, PairingStrategy::Random)
    }

    /// Topology domain a node belongs to under this strategy. Rack domains of
    /// inter-rack pairing are scoped by cluster.
    pub fn domain_of(&self, topology: &Topology) -> Option<String> {
        let rack = topology.rack_id.as_deref().unwrap_or(UNKNOWN_DOMAIN);
        let cluster = topology.cluster_id.as_deref().unwrap_or(UNKNOWN_DOMAIN);
        match self {
            PairingStrategy::Random => None,
            PairingStrategy::IntraRack => Some(rack.to_string()),
            PairingStrategy::InterRack => Some(format!("{cluster}/{rack}")),
            PairingStrategy::InterCluster => Some(cluster.to_string()),
        }
    }
}

impl fmt::Display for PairingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PairingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "random" => Ok(PairingStrategy::Random),
            "intra_rack" => Ok(PairingStrategy::IntraRack),
            "inter_rack" => Ok(PairingStrategy::InterRack),
            "inter_cluster" => Ok(PairingStrategy::InterCluster),
            other => Err(format!(
                "unknown pairing mode '{other}', expected one of random, intra_rack, inter_rack, inter_cluster"
            )),
        }
    }
}

/// Which pass a unit belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pass {
    First,
    Second,
}

impl Pass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pass::First => "first",
            Pass::Second => "second",
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nodes selected to be tested together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestUnit {
    /// Short guid, unique per unit
    pub id: String,
    pub nodes: Vec<String>,
    /// Nodes whose verdict this unit decides. Equal to `nodes` on the first
    /// pass; on the second pass the healthy partners are excluded.
    pub targets: Vec<String>,
    pub strategy: PairingStrategy,
    pub pass: Pass,
    /// Epoch seconds
    pub created_at: i64,
    /// Epoch seconds after which the unit is timed out
    pub deadline: i64,
}

impl TestUnit {
    pub fn first_pass(nodes: Vec<String>, strategy: PairingStrategy, now: i64, ttl_secs: i64) -> Self {
        Self {
            id: short_guid(),
            targets: nodes.clone(),
            nodes,
            strategy,
            pass: Pass::First,
            created_at: now,
            deadline: now.saturating_add(ttl_secs),
        }
    }

    pub fn second_pass(
        nodes: Vec<String>,
        targets: Vec<String>,
        strategy: PairingStrategy,
        now: i64,
        ttl_secs: i64,
    ) -> Self {
        Self {
            id: short_guid(),
            nodes,
            targets,
            strategy,
            pass: Pass::Second,
            created_at: now,
            deadline: now.saturating_add(ttl_secs),
        }
    }

    pub fn is_target(&self, node: &str) -> bool {
        self.targets.iter().any(|n| n == node)
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }
}

impl fmt::Display for TestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.id, self.nodes.join(","))
    }
}

fn short_guid() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Result of one pairing run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pairing {
    pub groups: Vec<Vec<String>>,
    /// Candidates left for the next tick
    pub unpaired: Vec<String>,
}

/// Pairing engine with its own random source
pub struct PairingEngine {
    rng: ChaCha8Rng,
}

impl PairingEngine {
    /// A fixed seed makes every pairing reproducible
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self { rng }
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Group `nodes` into disjoint groups of exactly `group_size`
    pub fn pair(&mut self, nodes: &[Node], strategy: PairingStrategy, group_size: usize) -> Pairing {
        let mut names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
        names.sort();
        names.dedup();
        if group_size == 0 || names.is_empty() {
            return Pairing {
                groups: Vec::new(),
                unpaired: names,
            };
        }

        let mut pairing = match strategy {
            PairingStrategy::Random => self.chunk(names, group_size),
            PairingStrategy::IntraRack => {
                let mut pairing = Pairing::default();
                for (_, members) in partition(nodes, |t| strategy.domain_of(t)) {
                    let part = self.chunk(members, group_size);
                    pairing.groups.extend(part.groups);
                    pairing.unpaired.extend(part.unpaired);
                }
                pairing
            }
            PairingStrategy::InterCluster => {
                self.across(partition(nodes, |t| strategy.domain_of(t)), group_size)
            }
            PairingStrategy::InterRack => {
                let mut clusters: BTreeMap<String, Vec<Node>> = BTreeMap::new();
                for node in nodes {
                    let cluster = PairingStrategy::InterCluster
                        .domain_of(&node.topology)
                        .unwrap_or_else(|| UNKNOWN_DOMAIN.to_string());
                    clusters.entry(cluster).or_default().push(node.clone());
                }
                let mut pairing = Pairing::default();
                for members in clusters.values() {
                    let part = self.across(partition(members, |t| strategy.domain_of(t)), group_size);
                    pairing.groups.extend(part.groups);
                    pairing.unpaired.extend(part.unpaired);
                }
                pairing
            }
        };

        pairing.groups.shuffle(&mut self.rng);
        pairing.unpaired.sort();
        pairing
    }

    fn chunk(&mut self, mut names: Vec<String>, group_size: usize) -> Pairing {
        names.shuffle(&mut self.rng);
        let full = names.len() / group_size * group_size;
        let unpaired = names.split_off(full);
        let groups = names.chunks(group_size).map(<[String]>::to_vec).collect();
        Pairing { groups, unpaired }
    }

    /// One node per domain per group. Domains are matched at random each
    /// round; a leftover set of domains borrows unused nodes from other
    /// domains when there are any.
    fn across(&mut self, domains: BTreeMap<String, Vec<String>>, group_size: usize) -> Pairing {
        let mut pools: BTreeMap<String, Vec<String>> = domains
            .into_iter()
            .map(|(domain, mut members)| {
                members.shuffle(&mut self.rng);
                (domain, members)
            })
            .collect();
        let mut groups = Vec::new();

        loop {
            let mut active: Vec<String> = pools
                .iter()
                .filter(|(_, members)| !members.is_empty())
                .map(|(domain, _)| domain.clone())
                .collect();
            if active.len() < group_size {
                break;
            }
            active.shuffle(&mut self.rng);

            let full = active.len() / group_size * group_size;
            let leftover = active.split_off(full);
            for domain_group in active.chunks(group_size) {
                let group: Vec<String> = domain_group
                    .iter()
                    .filter_map(|d| pools.get_mut(d).and_then(Vec::pop))
                    .collect();
                groups.push(group);
            }

            if !leftover.is_empty() {
                let mut donors: Vec<String> = pools
                    .iter()
                    .filter(|(domain, members)| !members.is_empty() && !leftover.contains(domain))
                    .map(|(domain, _)| domain.clone())
                    .collect();
                let needed = group_size - leftover.len();
                if donors.len() >= needed {
                    donors.shuffle(&mut self.rng);
                    let group: Vec<String> = leftover
                        .iter()
                        .chain(donors.iter().take(needed))
                        .filter_map(|d| pools.get_mut(d).and_then(Vec::pop))
                        .collect();
                    groups.push(group);
                }
            }
        }

        let unpaired = pools.into_values().flatten().collect();
        Pairing { groups, unpaired }
    }
}

fn partition<F>(nodes: &[Node], domain: F) -> BTreeMap<String, Vec<String>>
where
    F: Fn(&Topology) -> Option<String>,
{
    let mut domains: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in nodes {
        let key = domain(&node.topology).unwrap_or_else(|| UNKNOWN_DOMAIN.to_string());
        domains.entry(key).or_default().push(node.name.clone());
    }
    for members in domains.values_mut() {
        members.sort();
        members.dedup();
    }
    domains
}
