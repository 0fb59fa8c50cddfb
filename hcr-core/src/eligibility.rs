//! Eligibility filter
//!
//! Reduces a registry view to the nodes that may be tested this tick.

use serde::Serialize;

use crate::labels::LabelSchema;
use crate::node::Node;

/// Why a node was left out of the candidate set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Exclusion {
    NotOptedIn,
    NotReady,
    Unexpired,
    InFlight,
}

/// Check a single node at time `now` (epoch seconds)
pub fn check(node: &Node, schema: &LabelSchema, now: i64) -> Result<(), Exclusion> {
    if !node.is_opted_in(schema) {
        return Err(Exclusion::NotOptedIn);
    }
    if !node.is_ready(schema) {
        return Err(Exclusion::NotReady);
    }
    if node.in_flight(schema, now).is_some() {
        return Err(Exclusion::InFlight);
    }
    if node.needs_second_pass(schema) {
        return Ok(());
    }
    match node.valid_till(schema) {
        Some(till) if till > now => Err(Exclusion::Unexpired),
        _ => Ok(()),
    }
}

pub fn is_eligible(node: &Node, schema: &LabelSchema, now: i64) -> bool {
    check(node, schema, now).is_ok()
}

/// Eligible nodes split by which pass they enter
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    /// Nodes due for a regular first-pass test
    pub first_pass: Vec<Node>,
    /// Nodes still carrying the second-pass marker from an earlier tick
    pub carry_over: Vec<Node>,
}

impl Candidates {
    pub fn len(&self) -> usize {
        self.first_pass.len() + self.carry_over.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Filter the view and route marked nodes to the second pass
pub fn select(view: &[Node], schema: &LabelSchema, now: i64) -> Candidates {
    let mut candidates = Candidates::default();
    for node in view {
        if let Err(reason) = check(node, schema, now) {
            if reason != Exclusion::NotOptedIn {
                tracing::trace!(node = %node.name, reason = ?reason, "Node not eligible");
            }
            continue;
        }
        if node.needs_second_pass(schema) {
            candidates.carry_over.push(node.clone());
        } else {
            candidates.first_pass.push(node.clone());
        }
    }
    candidates
}
