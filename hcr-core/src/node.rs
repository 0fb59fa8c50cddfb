//! Node registry view
//!
//! A `Node` is a disposable snapshot of one cluster node built fresh on every
//! tick from the registry. Typed accessors decode the label strings; a label
//! that fails to decode is treated as absent.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::labels::{decode_epoch, InFlight, LabelSchema, Verdict};

/// Topology attributes used by the topology-aware pairing strategies
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topology {
    pub rack_id: Option<String>,
    pub cluster_id: Option<String>,
}

impl Topology {
    pub fn new(rack_id: Option<String>, cluster_id: Option<String>) -> Self {
        Self {
            rack_id,
            cluster_id,
        }
    }
}

/// Taint effect applied to excluded nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    PreferNoSchedule,
    NoSchedule,
}

impl TaintEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoSchedule => "NoSchedule",
        }
    }

    /// Parse the Kubernetes spelling. `NoExecute` and unknown effects map to `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PreferNoSchedule" => Some(TaintEffect::PreferNoSchedule),
            "NoSchedule" => Some(TaintEffect::NoSchedule),
            _ => None,
        }
    }
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A taint as seen on a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeTaint {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

impl NodeTaint {
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }
}

/// Test state derived from a node's labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestState {
    /// Never tested and not currently selectable
    Untested,
    /// Selectable by the eligibility filter
    Eligible,
    /// Held by a unit that has not started yet
    Scheduled,
    /// Held by a running unit
    Running,
    /// Passed and still within its validity window
    Passed,
    /// Failed, either provisionally (awaiting second pass) or finally
    Failed,
    /// Deadline exceeded. Only observed on in-process units; the registry
    /// keeps no trace of a timeout so the node returns to `Eligible`.
    TimedOut,
    /// Finally failed and tainted, until its validity window expires
    Excluded,
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestState::Untested => "UNTESTED",
            TestState::Eligible => "ELIGIBLE",
            TestState::Scheduled => "SCHEDULED",
            TestState::Running => "RUNNING",
            TestState::Passed => "PASSED",
            TestState::Failed => "FAILED",
            TestState::TimedOut => "TIMED_OUT",
            TestState::Excluded => "EXCLUDED",
        };
        f.write_str(name)
    }
}

/// Snapshot of a single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub topology: Topology,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<NodeTaint>,
    /// Platform readiness (for Kubernetes: the Ready condition and cordon state)
    pub ready: bool,
}

impl Node {
    /// Create a ready node with no labels
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topology: Topology::default(),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            ready: true,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_rack(mut self, rack_id: impl Into<String>) -> Self {
        self.topology.rack_id = Some(rack_id.into());
        self
    }

    pub fn with_cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.topology.cluster_id = Some(cluster_id.into());
        self
    }

    pub fn with_taint(mut self, taint: NodeTaint) -> Self {
        self.taints.push(taint);
        self
    }

    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn taint(&self, key: &str) -> Option<&NodeTaint> {
        self.taints.iter().find(|t| t.key == key)
    }

    /// Opted in through the test marker label
    pub fn is_opted_in(&self, schema: &LabelSchema) -> bool {
        self.label(schema.test_marker_key()) == Some(schema.test_marker_value())
    }

    /// Ready on the platform and not carrying the not-ready marker
    pub fn is_ready(&self, schema: &LabelSchema) -> bool {
        self.ready && !self.labels.contains_key(schema.not_ready_key())
    }

    pub fn valid_till(&self, schema: &LabelSchema) -> Option<i64> {
        self.label(&schema.valid_till()).and_then(decode_epoch)
    }

    pub fn runtime(&self, schema: &LabelSchema) -> Option<i64> {
        self.label(&schema.runtime()).and_then(decode_epoch)
    }

    pub fn verdict(&self, schema: &LabelSchema) -> Option<Verdict> {
        self.label(&schema.result()).and_then(|v| v.parse().ok())
    }

    pub fn needs_second_pass(&self, schema: &LabelSchema) -> bool {
        self.labels.contains_key(&schema.second_pass_needed())
    }

    /// Whether the validity window is still open at `now` (epoch seconds)
    pub fn is_unexpired(&self, schema: &LabelSchema, now: i64) -> bool {
        self.valid_till(schema).map_or(false, |till| till > now)
    }

    /// In-flight marker, ignoring markers whose deadline has passed.
    /// A marker without a readable deadline is treated as stale.
    pub fn in_flight(&self, schema: &LabelSchema, now: i64) -> Option<InFlight> {
        let state: InFlight = self.label(&schema.state())?.parse().ok()?;
        let deadline = self.label(&schema.deadline()).and_then(decode_epoch)?;
        (deadline > now).then_some(state)
    }

    /// An in-flight marker that no longer holds the node
    pub fn has_stale_in_flight(&self, schema: &LabelSchema, now: i64) -> bool {
        self.labels.contains_key(&schema.state()) && self.in_flight(schema, now).is_none()
    }

    /// Derive the test state from labels and taints
    pub fn test_state(&self, schema: &LabelSchema, failed_taint: &NodeTaint, now: i64) -> TestState {
        match self.in_flight(schema, now) {
            Some(InFlight::Scheduled) => return TestState::Scheduled,
            Some(InFlight::Running) => return TestState::Running,
            None => {}
        }
        if self.needs_second_pass(schema) {
            return TestState::Failed;
        }
        if self.is_unexpired(schema, now) {
            let tainted = self
                .taint(&failed_taint.key)
                .map_or(false, |t| t.value == failed_taint.value);
            return match self.verdict(schema) {
                Some(Verdict::Fail) if tainted => TestState::Excluded,
                Some(Verdict::Fail) => TestState::Failed,
                _ => TestState::Passed,
            };
        }
        if self.is_opted_in(schema) && self.is_ready(schema) {
            TestState::Eligible
        } else {
            TestState::Untested
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
