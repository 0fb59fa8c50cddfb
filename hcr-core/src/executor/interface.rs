//! Workload executor trait and common types

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::labels::Verdict;

/// Diagnostic workload family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    /// Pairwise collective bandwidth test
    #[default]
    Nccl,
    /// Pairwise TCP throughput test
    Neper,
    /// Single-node GPU diagnostic
    Gpu,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Nccl => "nccl",
            WorkloadKind::Neper => "neper",
            WorkloadKind::Gpu => "gpu",
        }
    }

    /// Group size the workload is built for
    pub fn default_group_size(&self) -> usize {
        match self {
            WorkloadKind::Nccl | WorkloadKind::Neper => 2,
            WorkloadKind::Gpu => 1,
        }
    }

    pub fn is_multi_node(&self) -> bool {
        self.default_group_size() > 1
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nccl" => Ok(WorkloadKind::Nccl),
            "neper" => Ok(WorkloadKind::Neper),
            "gpu" | "dcgm" => Ok(WorkloadKind::Gpu),
            other => Err(format!("unknown workload kind: {other}")),
        }
    }
}

/// Everything an executor needs to launch one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Short unit id, also used as the workload's guid
    pub unit_id: String,
    pub nodes: Vec<String>,
    pub kind: WorkloadKind,
    pub second_pass: bool,
    pub health_validity_hours: u64,
    /// Free-form parameters passed through as environment
    pub params: BTreeMap<String, String>,
}

impl WorkloadSpec {
    /// Environment handed to the workload
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = self.params.clone();
        for (i, node) in self.nodes.iter().enumerate() {
            env.insert(format!("NODE{i}"), node.clone());
        }
        env.insert("SECOND_PASS".to_string(), self.second_pass.to_string());
        env.insert("SHORT_GUID".to_string(), self.unit_id.clone());
        env.insert(
            "HEALTH_VALIDITY_HOURS".to_string(),
            self.health_validity_hours.to_string(),
        );
        env
    }

    /// Stable short name fragment identifying the kind of run
    pub fn distinctor(&self) -> String {
        if self.second_pass {
            format!("{}-sp", self.kind)
        } else {
            self.kind.to_string()
        }
    }
}

/// Reference to a submitted workload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadHandle {
    pub unit_id: String,
    /// Backend name of the workload (e.g. the Job name)
    pub name: String,
}

impl fmt::Display for WorkloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Outcome reported by a finished workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub verdict: Verdict,
    /// Numeric outcome (bandwidth, throughput) if the workload reports one
    pub metric: Option<f64>,
    /// Nodes the workload attributes a failure to. Empty on a failing unit
    /// means every member is implicated.
    pub implicated: Vec<String>,
    /// Nodes that gave no definite answer (crashed or silent). They get no
    /// verdict from this run.
    #[serde(default)]
    pub released: Vec<String>,
}

impl UnitResult {
    pub fn pass(metric: Option<f64>) -> Self {
        Self {
            verdict: Verdict::Pass,
            metric,
            implicated: Vec::new(),
            released: Vec::new(),
        }
    }

    pub fn fail(metric: Option<f64>, implicated: Vec<String>) -> Self {
        Self {
            verdict: Verdict::Fail,
            metric,
            implicated,
            released: Vec::new(),
        }
    }

    pub fn with_released(mut self, released: Vec<String>) -> Self {
        self.released = released;
        self
    }

    pub fn is_released(&self, node: &str) -> bool {
        self.released.iter().any(|n| n == node)
    }

    /// Verdict for one member node
    pub fn verdict_for(&self, node: &str) -> Verdict {
        match self.verdict {
            Verdict::Pass => Verdict::Pass,
            Verdict::Fail if self.implicated.is_empty() => Verdict::Fail,
            Verdict::Fail if self.implicated.iter().any(|n| n == node) => Verdict::Fail,
            Verdict::Fail => Verdict::Pass,
        }
    }
}

/// What `await_completion` observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Completion {
    Finished(UnitResult),
    TimedOut,
}

/// Errors that can occur while driving a workload
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Workload could not be created
    #[error("Failed to submit workload: {0}")]
    Submit(String),

    /// Workload crashed or produced output that cannot be interpreted
    #[error("Inconclusive workload result: {0}")]
    Inconclusive(String),

    /// Cleanup failed
    #[error("Failed to cancel workload: {0}")]
    Cancel(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Workload executor interface
///
/// Implementations run one diagnostic workload per unit on the given nodes
/// and report its outcome.
#[async_trait]
pub trait WorkloadExecutor: Send + Sync {
    /// Launch a workload
    async fn submit(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, ExecutorError>;

    /// Wait for the workload to finish, giving up at `deadline`
    async fn await_completion(
        &self,
        handle: &WorkloadHandle,
        deadline: Instant,
    ) -> Result<Completion, ExecutorError>;

    /// Release any resources the workload still holds
    async fn cancel(&self, handle: &WorkloadHandle) -> Result<(), ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(nodes: &[&str], second_pass: bool) -> WorkloadSpec {
        WorkloadSpec {
            unit_id: "ab12cd".to_string(),
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            kind: WorkloadKind::Nccl,
            second_pass,
            health_validity_hours: 24,
            params: BTreeMap::from([("NHOSTS".to_string(), "2".to_string())]),
        }
    }

    #[test]
    fn test_workload_env() {
        let env = spec(&["n1", "n2"], true).env();
        assert_eq!(env["NODE0"], "n1");
        assert_eq!(env["NODE1"], "n2");
        assert_eq!(env["SECOND_PASS"], "true");
        assert_eq!(env["SHORT_GUID"], "ab12cd");
        assert_eq!(env["HEALTH_VALIDITY_HOURS"], "24");
        assert_eq!(env["NHOSTS"], "2");
    }

    #[test]
    fn test_distinctor() {
        assert_eq!(spec(&["n1"], false).distinctor(), "nccl");
        assert_eq!(spec(&["n1"], true).distinctor(), "nccl-sp");
    }

    #[test]
    fn test_workload_kind() {
        assert_eq!("GPU".parse::<WorkloadKind>().unwrap(), WorkloadKind::Gpu);
        assert_eq!(WorkloadKind::Neper.default_group_size(), 2);
        assert!(!WorkloadKind::Gpu.is_multi_node());
        assert!("tcp".parse::<WorkloadKind>().is_err());
    }

    #[test]
    fn test_verdict_attribution() {
        let all = UnitResult::fail(None, Vec::new());
        assert_eq!(all.verdict_for("a"), Verdict::Fail);

        let one = UnitResult::fail(Some(3.0), vec!["a".to_string()]);
        assert_eq!(one.verdict_for("a"), Verdict::Fail);
        assert_eq!(one.verdict_for("b"), Verdict::Pass);

        assert_eq!(UnitResult::pass(None).verdict_for("a"), Verdict::Pass);
    }

    #[test]
    fn test_released_nodes() {
        let result = UnitResult::fail(None, vec!["a".to_string()]).with_released(vec!["b".to_string()]);
        assert!(result.is_released("b"));
        assert!(!result.is_released("a"));
        assert_eq!(result.verdict_for("a"), Verdict::Fail);
    }
}
