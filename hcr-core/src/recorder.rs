//! Result recorder
//!
//! Turns a unit outcome into label and taint writes. The full plan for a
//! unit is computed up front and applied as one batch, so writing the same
//! outcome twice yields the same labels.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dispatcher::UnitOutcome;
use crate::labels::{encode_metric, epoch_after, LabelSchema, Verdict};
use crate::node::{Node, NodeTaint, TaintEffect};
use crate::pairing::TestUnit;
use crate::registry::{NodeWrite, Registry, RegistryError, TaintOp, WriteBatch};
use crate::second_pass::leads_to_second_pass;

/// Taints written for failing nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintPolicy {
    pub key: String,
    pub failed_value: String,
    pub failed_effect: TaintEffect,
    pub suspect_value: String,
    pub suspect_effect: TaintEffect,
}

impl TaintPolicy {
    /// Taint key equal to the label prefix
    pub fn for_schema(schema: &LabelSchema) -> Self {
        Self {
            key: schema.prefix().to_string(),
            failed_value: "failed".to_string(),
            failed_effect: TaintEffect::NoSchedule,
            suspect_value: "suspect".to_string(),
            suspect_effect: TaintEffect::PreferNoSchedule,
        }
    }

    pub fn failed(&self) -> NodeTaint {
        NodeTaint::new(&self.key, &self.failed_value, self.failed_effect)
    }

    pub fn suspect(&self) -> NodeTaint {
        NodeTaint::new(&self.key, &self.suspect_value, self.suspect_effect)
    }
}

/// What the recorder decided for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Passed,
    /// Failed the first pass, a confirmatory run follows
    Suspect,
    /// Failed for good
    Failed,
    /// No verdict; in-flight markers removed only
    Released,
}

/// Decisions for every member of a unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPlan {
    pub batch: WriteBatch,
    pub decisions: Vec<(String, Decision)>,
}

impl RecordPlan {
    pub fn nodes_with(&self, decision: Decision) -> Vec<String> {
        self.decisions
            .iter()
            .filter(|(_, d)| *d == decision)
            .map(|(n, _)| n.clone())
            .collect()
    }
}

/// Writes unit outcomes back to the registry
#[derive(Debug, Clone)]
pub struct Recorder {
    schema: LabelSchema,
    taints: TaintPolicy,
    validity: Duration,
    dry_run: bool,
}

impl Recorder {
    pub fn new(schema: LabelSchema, taints: TaintPolicy, validity: Duration, dry_run: bool) -> Self {
        Self {
            schema,
            taints,
            validity,
            dry_run,
        }
    }

    pub fn schema(&self) -> &LabelSchema {
        &self.schema
    }

    pub fn taints(&self) -> &TaintPolicy {
        &self.taints
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn valid_till(&self, now: i64) -> String {
        epoch_after(now, self.validity).to_string()
    }

    /// Writes shared by every verdict
    fn verdict_write(&self, node: &str, verdict: Verdict, metric: Option<f64>, now: i64) -> NodeWrite {
        let mut write = NodeWrite::new(node)
            .set(self.schema.result(), verdict.as_label())
            .set(self.schema.valid_till(), self.valid_till(now))
            .set(self.schema.runtime(), now.to_string());
        write = match metric.and_then(encode_metric) {
            Some(value) => write.set(self.schema.metric(), value),
            None => write.remove(self.schema.metric()),
        };
        for key in self.schema.in_flight_keys() {
            write = write.remove(key);
        }
        write
    }

    fn with_taint(&self, write: NodeWrite, op: TaintOp) -> NodeWrite {
        if self.dry_run {
            if let TaintOp::Set(taint) = &op {
                info!(
                    node = %write.node,
                    taint = %format!("{}={}:{}", taint.key, taint.value, taint.effect),
                    "[DRY-RUN] Would taint node"
                );
            }
            write
        } else {
            write.taint(op)
        }
    }

    fn released(&self, node: &str) -> NodeWrite {
        self.schema
            .in_flight_keys()
            .into_iter()
            .fold(NodeWrite::new(node), |write, key| write.remove(key))
    }

    fn passed(&self, node: &str, metric: Option<f64>, now: i64) -> NodeWrite {
        let write = self
            .verdict_write(node, Verdict::Pass, metric, now)
            .remove(self.schema.second_pass_needed());
        self.with_taint(write, TaintOp::Remove(self.taints.key.clone()))
    }

    fn suspect(&self, node: &str, metric: Option<f64>, now: i64) -> NodeWrite {
        let write = self
            .verdict_write(node, Verdict::Fail, metric, now)
            .set(self.schema.second_pass_needed(), "true");
        self.with_taint(write, TaintOp::Set(self.taints.suspect()))
    }

    fn failed(&self, node: &str, metric: Option<f64>, now: i64) -> NodeWrite {
        let write = self
            .verdict_write(node, Verdict::Fail, metric, now)
            .remove(self.schema.second_pass_needed());
        self.with_taint(write, TaintOp::Set(self.taints.failed()))
    }

    /// Compute the writes for one unit.
    ///
    /// `second_pass_follows` marks first-pass failures as provisional. On a
    /// second-pass unit only the targets receive a verdict.
    pub fn plan(
        &self,
        unit: &TestUnit,
        outcome: &UnitOutcome,
        second_pass_follows: bool,
        now: i64,
    ) -> RecordPlan {
        let mut plan = RecordPlan::default();
        let provisional = second_pass_follows && leads_to_second_pass(unit);

        for node in &unit.nodes {
            let (write, decision) = match outcome {
                UnitOutcome::Completed(result) if unit.is_target(node) && !result.is_released(node) => {
                    match result.verdict_for(node) {
                        Verdict::Pass => (self.passed(node, result.metric, now), Decision::Passed),
                        Verdict::Fail if provisional => {
                            (self.suspect(node, result.metric, now), Decision::Suspect)
                        }
                        Verdict::Fail => (self.failed(node, result.metric, now), Decision::Failed),
                    }
                }
                _ => (self.released(node), Decision::Released),
            };
            plan.batch.push(write);
            plan.decisions.push((node.clone(), decision));
        }
        plan
    }

    /// Plan and apply the writes for one unit
    pub async fn record<R>(
        &self,
        registry: &R,
        unit: &TestUnit,
        outcome: &UnitOutcome,
        second_pass_follows: bool,
        now: i64,
    ) -> Result<RecordPlan, RegistryError>
    where
        R: Registry + ?Sized,
    {
        let plan = self.plan(unit, outcome, second_pass_follows, now);
        registry.apply(&plan.batch).await?;

        for (node, decision) in &plan.decisions {
            match decision {
                Decision::Passed => info!(node = %node, unit = %unit.id, pass = %unit.pass, "Node passed"),
                Decision::Suspect => warn!(
                    node = %node,
                    unit = %unit.id,
                    "Node failed first pass, confirmatory run pending"
                ),
                Decision::Failed => warn!(node = %node, unit = %unit.id, pass = %unit.pass, "Node failed"),
                Decision::Released => debug!(node = %node, unit = %unit.id, "Node released without verdict"),
            }
        }
        Ok(plan)
    }

    /// Finalize nodes left awaiting a second pass that cannot be given one
    pub fn finalize_failed(&self, nodes: &[Node], now: i64) -> RecordPlan {
        let mut plan = RecordPlan::default();
        for node in nodes {
            let metric = node
                .label(&self.schema.metric())
                .and_then(|v| v.parse::<f64>().ok());
            plan.batch.push(self.failed(&node.name, metric, now));
            plan.decisions.push((node.name.clone(), Decision::Failed));
        }
        plan
    }

    /// Remove in-flight markers whose deadline has passed
    pub fn reconcile_stale(&self, view: &[Node], now: i64) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for node in view.iter().filter(|n| n.has_stale_in_flight(&self.schema, now)) {
            debug!(node = %node.name, "Clearing stale in-flight marker");
            batch.push(self.released(&node.name));
        }
        batch
    }
}
