//! Mock executor for testing

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{Completion, ExecutorError, UnitResult, WorkloadExecutor, WorkloadHandle, WorkloadSpec};

/// Scripted behavior for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Fails every run
    Fail,
    /// Fails first-pass runs, passes second-pass runs
    FailFirstPass,
    /// Never finishes
    Hang,
    /// Finishes with unparseable output
    Crash,
}

/// Mock executor driven by per-node behaviors
pub struct MockExecutor {
    behaviors: RwLock<HashMap<String, MockBehavior>>,
    /// Simulated run time of every workload
    run_time: Duration,
    /// Fail every `submit` call
    reject_submit: RwLock<bool>,
    /// Name the failing nodes; otherwise the whole unit is blamed
    attribute_failures: RwLock<bool>,
    submitted: RwLock<Vec<WorkloadSpec>>,
    active: RwLock<HashMap<String, WorkloadSpec>>,
    cancelled: RwLock<HashSet<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    /// Metric reported by passing runs
    pub pass_metric: f64,
    /// Metric reported by failing runs
    pub fail_metric: f64,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            behaviors: RwLock::new(HashMap::new()),
            run_time: Duration::from_secs(60),
            reject_submit: RwLock::new(false),
            attribute_failures: RwLock::new(true),
            submitted: RwLock::new(Vec::new()),
            active: RwLock::new(HashMap::new()),
            cancelled: RwLock::new(HashSet::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            pass_metric: 120.0,
            fail_metric: 12.5,
        }
    }

    pub async fn set_behavior(&self, node: &str, behavior: MockBehavior) {
        self.behaviors.write().await.insert(node.to_string(), behavior);
    }

    pub async fn fail_always(&self, node: &str) {
        self.set_behavior(node, MockBehavior::Fail).await;
    }

    pub async fn fail_first_pass(&self, node: &str) {
        self.set_behavior(node, MockBehavior::FailFirstPass).await;
    }

    pub async fn hang(&self, node: &str) {
        self.set_behavior(node, MockBehavior::Hang).await;
    }

    pub async fn crash(&self, node: &str) {
        self.set_behavior(node, MockBehavior::Crash).await;
    }

    pub async fn set_reject_submit(&self, reject: bool) {
        *self.reject_submit.write().await = reject;
    }

    pub async fn set_attribute_failures(&self, attribute: bool) {
        *self.attribute_failures.write().await = attribute;
    }

    /// Every spec submitted so far, in submission order
    pub async fn submitted(&self) -> Vec<WorkloadSpec> {
        self.submitted.read().await.clone()
    }

    pub async fn was_cancelled(&self, handle: &str) -> bool {
        self.cancelled.read().await.contains(handle)
    }

    /// Highest number of workloads observed running at once
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn release(&self) {
        let _ = self
            .running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    async fn outcome(&self, spec: &WorkloadSpec) -> Result<Option<UnitResult>, ExecutorError> {
        let behaviors = self.behaviors.read().await;
        let mut implicated = Vec::new();
        for node in &spec.nodes {
            match behaviors.get(node) {
                Some(MockBehavior::Hang) => return Ok(None),
                Some(MockBehavior::Crash) => {
                    return Err(ExecutorError::Inconclusive(format!(
                        "workload on {node} exited without a result"
                    )))
                }
                Some(MockBehavior::Fail) => implicated.push(node.clone()),
                Some(MockBehavior::FailFirstPass) if !spec.second_pass => {
                    implicated.push(node.clone())
                }
                _ => {}
            }
        }
        if implicated.is_empty() {
            Ok(Some(UnitResult::pass(Some(self.pass_metric))))
        } else if *self.attribute_failures.read().await {
            Ok(Some(UnitResult::fail(Some(self.fail_metric), implicated)))
        } else {
            Ok(Some(UnitResult::fail(Some(self.fail_metric), Vec::new())))
        }
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkloadExecutor for MockExecutor {
    async fn submit(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, ExecutorError> {
        if *self.reject_submit.read().await {
            return Err(ExecutorError::Submit("mock executor rejects submissions".to_string()));
        }
        let handle = WorkloadHandle {
            unit_id: spec.unit_id.clone(),
            name: format!("mock-{}-{}", spec.distinctor(), spec.unit_id),
        };
        self.submitted.write().await.push(spec.clone());
        self.active
            .write()
            .await
            .insert(handle.name.clone(), spec.clone());
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);
        Ok(handle)
    }

    async fn await_completion(
        &self,
        handle: &WorkloadHandle,
        deadline: Instant,
    ) -> Result<Completion, ExecutorError> {
        let spec = self
            .active
            .read()
            .await
            .get(&handle.name)
            .cloned()
            .ok_or_else(|| ExecutorError::Other(format!("unknown workload {handle}")))?;

        let outcome = self.outcome(&spec).await;
        let finish_at = Instant::now() + self.run_time;

        let completion = match outcome {
            Ok(Some(result)) if finish_at <= deadline => {
                tokio::time::sleep_until(finish_at).await;
                Ok(Completion::Finished(result))
            }
            Ok(_) => {
                tokio::time::sleep_until(deadline).await;
                Ok(Completion::TimedOut)
            }
            Err(e) => {
                tokio::time::sleep_until(finish_at.min(deadline)).await;
                Err(e)
            }
        };

        if self.active.write().await.remove(&handle.name).is_some() {
            self.release();
        }
        completion
    }

    async fn cancel(&self, handle: &WorkloadHandle) -> Result<(), ExecutorError> {
        self.cancelled.write().await.insert(handle.name.clone());
        if self.active.write().await.remove(&handle.name).is_some() {
            self.release();
        }
        Ok(())
    }
}
