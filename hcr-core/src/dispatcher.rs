//! Dispatcher
//!
//! Drives admitted units through the executor. Units run concurrently; each
//! one waits for its own deadline and is recorded as soon as it finishes, so
//! a slow or failing unit never holds up the others.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::admission::BudgetPermit;
use crate::error::OrchestratorError;
use crate::executor::{Completion, UnitResult, WorkloadExecutor, WorkloadKind, WorkloadSpec};
use crate::labels::{epoch_after, InFlight};
use crate::metrics::MetricsRegistry;
use crate::node::TestState;
use crate::pairing::{Pass, TestUnit};
use crate::recorder::{RecordPlan, Recorder};
use crate::registry::{NodeWrite, Registry, WriteBatch};

/// How a dispatched unit ended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum UnitOutcome {
    Completed(UnitResult),
    /// Deadline exceeded; an outcome, not an error
    TimedOut,
    /// Crash or unreadable output
    Inconclusive(String),
    /// Never reached the executor
    NotDispatched(String),
}

impl UnitOutcome {
    /// Short name used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            UnitOutcome::Completed(r) if r.verdict.is_pass() => "pass",
            UnitOutcome::Completed(_) => "fail",
            UnitOutcome::TimedOut => "timeout",
            UnitOutcome::Inconclusive(_) => "inconclusive",
            UnitOutcome::NotDispatched(_) => "not_dispatched",
        }
    }

    /// State the unit's targets are left in. Nodes without a verdict
    /// return to `Eligible`.
    pub fn node_state(&self) -> TestState {
        match self {
            UnitOutcome::Completed(r) if r.verdict.is_pass() => TestState::Passed,
            UnitOutcome::Completed(_) => TestState::Failed,
            UnitOutcome::TimedOut => TestState::TimedOut,
            UnitOutcome::Inconclusive(_) | UnitOutcome::NotDispatched(_) => TestState::Eligible,
        }
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOutcome::Inconclusive(reason) | UnitOutcome::NotDispatched(reason) => {
                write!(f, "{}: {}", self.kind(), reason)
            }
            _ => f.write_str(self.kind()),
        }
    }
}

/// Workload settings shared by every unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadTemplate {
    pub kind: WorkloadKind,
    pub params: BTreeMap<String, String>,
    pub health_validity_hours: u64,
}

impl WorkloadTemplate {
    /// Second-pass runs report with a validity of zero hours; their verdict
    /// is written by the recorder alone.
    pub fn spec_for(&self, unit: &TestUnit) -> WorkloadSpec {
        let second_pass = unit.pass == Pass::Second;
        WorkloadSpec {
            unit_id: unit.id.clone(),
            nodes: unit.nodes.clone(),
            kind: self.kind,
            second_pass,
            health_validity_hours: if second_pass { 0 } else { self.health_validity_hours },
            params: self.params.clone(),
        }
    }
}

/// Everything known about one unit after dispatch
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub unit: TestUnit,
    pub outcome: UnitOutcome,
    /// `None` when the registry rejected the result writes
    pub plan: Option<RecordPlan>,
    pub elapsed: Duration,
}

pub struct Dispatcher {
    registry: Arc<dyn Registry>,
    executor: Arc<dyn WorkloadExecutor>,
    recorder: Recorder,
    workload: WorkloadTemplate,
    cleanup_on_timeout: bool,
    metrics: MetricsRegistry,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn Registry>,
        executor: Arc<dyn WorkloadExecutor>,
        recorder: Recorder,
        workload: WorkloadTemplate,
        cleanup_on_timeout: bool,
    ) -> Self {
        Self {
            registry,
            executor,
            recorder,
            workload,
            cleanup_on_timeout,
            metrics: MetricsRegistry::new(),
        }
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Dispatch every admitted unit and wait for all of them.
    ///
    /// `now` is the tick time in epoch seconds; results are stamped with the
    /// time they completed.
    pub async fn dispatch_all(
        &self,
        admitted: Vec<(TestUnit, BudgetPermit)>,
        second_pass_follows: bool,
        now: i64,
    ) -> Vec<DispatchReport> {
        let runs = admitted
            .into_iter()
            .map(|(unit, permit)| self.run_unit(unit, permit, second_pass_follows, now));
        join_all(runs).await
    }

    fn in_flight_batch(&self, unit: &TestUnit, state: InFlight) -> WriteBatch {
        let schema = self.recorder.schema();
        let mut batch = WriteBatch::new();
        for node in &unit.nodes {
            batch.push(
                NodeWrite::new(node)
                    .set(schema.state(), state.as_label())
                    .set(schema.deadline(), unit.deadline.to_string()),
            );
        }
        batch
    }

    async fn run_unit(
        &self,
        unit: TestUnit,
        _permit: BudgetPermit,
        second_pass_follows: bool,
        now: i64,
    ) -> DispatchReport {
        let started = Instant::now();
        self.metrics
            .inc_units_dispatched(unit.pass.as_str(), unit.strategy.as_str());

        let outcome = self.execute(&unit, now).await;
        let elapsed = started.elapsed();
        let finished_at = epoch_after(now, elapsed);

        let plan = match self
            .recorder
            .record(self.registry.as_ref(), &unit, &outcome, second_pass_follows, finished_at)
            .await
        {
            Ok(plan) => Some(plan),
            Err(e) => {
                error!(unit = %unit.id, error = %e, "Failed to record unit result");
                None
            }
        };

        self.metrics.inc_unit_outcome(outcome.kind());
        self.metrics
            .observe_unit_duration(unit.pass.as_str(), elapsed.as_secs_f64());
        info!(
            unit = %unit.id,
            nodes = ?unit.nodes,
            pass = %unit.pass,
            outcome = %outcome,
            state = %outcome.node_state(),
            elapsed_secs = elapsed.as_secs(),
            "Unit finished"
        );

        DispatchReport {
            unit,
            outcome,
            plan,
            elapsed,
        }
    }

    async fn execute(&self, unit: &TestUnit, now: i64) -> UnitOutcome {
        if let Err(e) = self
            .registry
            .apply(&self.in_flight_batch(unit, InFlight::Scheduled))
            .await
        {
            warn!(unit = %unit.id, error = %e, "Failed to mark unit scheduled");
            return UnitOutcome::NotDispatched(e.to_string());
        }

        let spec = self.workload.spec_for(unit);
        let handle = match self.executor.submit(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(unit = %unit.id, error = %e, "Failed to submit workload");
                return UnitOutcome::NotDispatched(e.to_string());
            }
        };
        debug!(unit = %unit.id, workload = %handle, "Workload submitted");

        if let Err(e) = self
            .registry
            .apply(&self.in_flight_batch(unit, InFlight::Running))
            .await
        {
            warn!(unit = %unit.id, error = %e, "Failed to mark unit running");
        }

        let ttl = Duration::from_secs(u64::try_from(unit.deadline.saturating_sub(now)).unwrap_or(0));
        let deadline = Instant::now() + ttl;
        let completion = tokio::time::timeout_at(
            deadline,
            self.executor.await_completion(&handle, deadline),
        )
        .await;

        let outcome = match completion {
            Ok(Ok(Completion::Finished(result))) => UnitOutcome::Completed(result),
            Ok(Ok(Completion::TimedOut)) | Err(_) => UnitOutcome::TimedOut,
            Ok(Err(source)) => {
                let err = OrchestratorError::WorkloadExecution {
                    unit: unit.id.clone(),
                    source,
                };
                warn!(unit = %unit.id, error = %err, "Unit result inconclusive");
                UnitOutcome::Inconclusive(err.to_string())
            }
        };

        let cleanup = match outcome {
            UnitOutcome::TimedOut => {
                warn!(unit = %unit.id, workload = %handle, ttl = ?ttl, "Unit timed out");
                self.cleanup_on_timeout
            }
            UnitOutcome::Inconclusive(_) => true,
            _ => false,
        };
        if cleanup {
            if let Err(e) = self.executor.cancel(&handle).await {
                warn!(unit = %unit.id, workload = %handle, error = %e, "Failed to clean up workload");
            }
        }
        outcome
    }
}
