//! Health check orchestrator
//!
//! One tick reads the registry, forms and admits units, dispatches them,
//! records results and runs the confirmatory second pass. Nothing survives a
//! tick except what was written to node labels.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::admission::{self, AdmissionController};
use crate::config::OrchestratorConfig;
use crate::dispatcher::{DispatchReport, Dispatcher, UnitOutcome, WorkloadTemplate};
use crate::eligibility;
use crate::error::OrchestratorError;
use crate::executor::WorkloadExecutor;
use crate::labels::{epoch_after, LabelSchema};
use crate::metrics::MetricsRegistry;
use crate::node::{Node, TestState};
use crate::pairing::{Pass, PairingEngine, TestUnit};
use crate::recorder::{Decision, Recorder};
use crate::registry::Registry;
use crate::second_pass::{combine_verdicts, HealthyNode, SecondPassController};

/// Summary of one tick
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Epoch seconds
    pub started_at: i64,
    pub eligible: usize,
    pub carry_over: usize,
    pub in_flight_units: usize,
    pub stale_cleared: usize,
    pub formed: usize,
    pub admitted: usize,
    pub deferred: usize,
    pub unpaired: usize,
    pub second_pass_units: usize,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    /// First-pass failures still awaiting confirmation
    pub suspect: Vec<String>,
    pub timed_out: Vec<String>,
    pub inconclusive: Vec<String>,
}

/// Verdicts gathered from dispatch reports
#[derive(Debug, Default)]
struct Tally {
    first_passed: BTreeSet<String>,
    first_failed: BTreeSet<String>,
    suspects: BTreeSet<String>,
    second_passed: BTreeSet<String>,
    second_failed: BTreeSet<String>,
    /// Passed nodes with the time they finished
    passed_at: BTreeMap<String, i64>,
    timed_out: BTreeSet<String>,
    inconclusive: BTreeSet<String>,
    taints: BTreeMap<&'static str, u64>,
}

impl Tally {
    fn add(&mut self, report: &DispatchReport, tick_now: i64, dry_run: bool) {
        let Some(plan) = &report.plan else {
            return;
        };
        let finished_at = epoch_after(tick_now, report.elapsed);
        for (node, decision) in &plan.decisions {
            let node = node.clone();
            match (report.unit.pass, decision) {
                (_, Decision::Released) => match &report.outcome {
                    UnitOutcome::TimedOut => {
                        self.timed_out.insert(node);
                    }
                    UnitOutcome::Inconclusive(_) | UnitOutcome::NotDispatched(_) => {
                        self.inconclusive.insert(node);
                    }
                    UnitOutcome::Completed(result) if result.is_released(&node) => {
                        self.inconclusive.insert(node);
                    }
                    UnitOutcome::Completed(_) => {}
                },
                (Pass::First, Decision::Passed) => {
                    self.passed_at.insert(node.clone(), finished_at);
                    self.first_passed.insert(node);
                }
                (Pass::First, Decision::Suspect) => {
                    self.suspects.insert(node.clone());
                    self.first_failed.insert(node);
                }
                (Pass::First, Decision::Failed) => {
                    self.first_failed.insert(node);
                }
                (Pass::Second, Decision::Passed) => {
                    self.passed_at.insert(node.clone(), finished_at);
                    self.second_passed.insert(node);
                }
                (Pass::Second, Decision::Suspect | Decision::Failed) => {
                    self.second_failed.insert(node);
                }
            }
            if !dry_run {
                match decision {
                    Decision::Suspect => *self.taints.entry("suspect").or_default() += 1,
                    Decision::Failed => *self.taints.entry("failed").or_default() += 1,
                    _ => {}
                }
            }
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    schema: LabelSchema,
    registry: Arc<dyn Registry>,
    pairing: Mutex<PairingEngine>,
    second_pass: SecondPassController,
    admission: AdmissionController,
    dispatcher: Dispatcher,
    metrics: MetricsRegistry,
}

impl Orchestrator {
    /// Validate `config` and wire up the components
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<dyn Registry>,
        executor: Arc<dyn WorkloadExecutor>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let schema = config.schema();
        let recorder = Recorder::new(
            schema.clone(),
            config.taint_policy(),
            config.health_validity,
            config.dry_run,
        );
        let workload = WorkloadTemplate {
            kind: config.workload,
            params: config.workload_params.clone(),
            health_validity_hours: config.health_validity_hours(),
        };
        let dispatcher = Dispatcher::new(
            registry.clone(),
            executor,
            recorder,
            workload,
            config.cleanup_on_timeout,
        );

        Ok(Self {
            pairing: Mutex::new(PairingEngine::new(config.seed)),
            second_pass: SecondPassController::new(
                config.strategy,
                config.group_size,
                config.second_pass_policy,
            ),
            admission: AdmissionController::new(config.admission_mode()),
            schema,
            registry,
            dispatcher,
            metrics: MetricsRegistry::new(),
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Second pass enabled and able to disambiguate at this group size
    fn second_pass_active(&self) -> bool {
        self.config.second_pass_enabled && self.second_pass.is_applicable()
    }

    /// Run ticks until shutdown is signalled. A running tick is allowed to
    /// finish so that every dispatched unit gets recorded.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            strategy = %self.config.strategy,
            group_size = self.config.group_size,
            workload = %self.config.workload,
            admission = ?self.admission.mode(),
            second_pass = self.second_pass_active(),
            dry_run = self.config.dry_run,
            tick_interval = %humantime::format_duration(self.config.tick_interval),
            sleep_time = %humantime::format_duration(self.config.sleep_time),
            health_validity = %humantime::format_duration(self.config.health_validity),
            "Starting health check orchestrator"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) => debug!(
                            report = %serde_json::to_string(&report).unwrap_or_default(),
                            "Tick report"
                        ),
                        Err(e) if e.is_transient() => warn!(error = %e, "Tick abandoned, retrying next tick"),
                        Err(e) => {
                            error!(error = %e, "Tick failed");
                            return Err(e.into());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutdown signal received, stopping orchestrator");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Run a single tick (for --once mode)
    pub async fn run_once(&self) -> Result<TickReport, OrchestratorError> {
        info!("Running single scheduling tick");
        self.tick().await
    }

    pub async fn tick(&self) -> Result<TickReport, OrchestratorError> {
        self.tick_at(Utc::now().timestamp()).await
    }

    /// Run one tick with `now` as the current time in epoch seconds
    pub async fn tick_at(&self, now: i64) -> Result<TickReport, OrchestratorError> {
        let started = Instant::now();
        let result = self.tick_inner(now, started).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.metrics
            .observe_tick_duration(outcome, started.elapsed().as_secs_f64());
        result
    }

    async fn tick_inner(&self, now: i64, started: Instant) -> Result<TickReport, OrchestratorError> {
        let recorder = self.dispatcher.recorder();
        let g = self.config.group_size;
        let ttl = self.config.sleep_time_secs();
        let mut report = TickReport {
            started_at: now,
            ..Default::default()
        };

        let filter = BTreeMap::from([(
            self.schema.test_marker_key().to_string(),
            self.schema.test_marker_value().to_string(),
        )]);
        let view = self.registry.list_nodes(&filter).await?;
        let by_name: BTreeMap<&str, &Node> = view.iter().map(|n| (n.name.as_str(), n)).collect();

        let stale = recorder.reconcile_stale(&view, now);
        if !stale.is_empty() {
            report.stale_cleared = stale.len();
            if let Err(e) = self.registry.apply(&stale).await {
                warn!(error = %e, "Failed to clear stale in-flight markers");
            }
        }

        report.in_flight_units = admission::in_flight_units(&view, &self.schema, now, g);
        self.metrics.set_in_flight_units(report.in_flight_units as i64);

        let candidates = eligibility::select(&view, &self.schema, now);
        report.eligible = candidates.len();
        report.carry_over = candidates.carry_over.len();
        self.metrics.set_eligible_nodes(candidates.len() as i64);

        let mut tally = Tally::default();
        let mut finalized = BTreeSet::new();
        let mut units: Vec<TestUnit> = Vec::new();

        {
            let mut pairing = self.pairing.lock().await;

            // Nodes marked on an earlier tick are retested before new work
            if !candidates.carry_over.is_empty() {
                let plan = if self.second_pass_active() {
                    let healthy = self.healthy_pool(&view, &tally, now);
                    self.second_pass
                        .plan(&candidates.carry_over, healthy, pairing.rng(), now, ttl)
                } else {
                    Default::default()
                };
                let leftover = candidates
                    .carry_over
                    .iter()
                    .filter(|n| !plan.units.iter().any(|u| u.is_target(&n.name)));
                // Untested or running nodes may still become partners, until
                // the node has waited out the second pass timeout
                let partner_possible = self.second_pass_active()
                    && (!candidates.first_pass.is_empty() || report.in_flight_units > 0);
                let (waiting, expired): (Vec<Node>, Vec<Node>) = leftover
                    .cloned()
                    .partition(|n| partner_possible && !self.waited_out(n, now));
                if !waiting.is_empty() {
                    debug!(nodes = waiting.len(), "Confirmatory runs waiting for a healthy partner");
                }
                if !expired.is_empty() {
                    let finalize = recorder.finalize_failed(&expired, now);
                    match self.registry.apply(&finalize.batch).await {
                        Ok(()) => {
                            for node in &expired {
                                warn!(node = %node.name, "No partner for confirmatory run, marking failed");
                                finalized.insert(node.name.clone());
                            }
                            if !recorder.is_dry_run() {
                                *tally.taints.entry("failed").or_default() += expired.len() as u64;
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to finalize unpartnered nodes"),
                    }
                }
                report.second_pass_units += plan.units.len();
                units.extend(plan.units);
            }

            let pairing_result = pairing.pair(&candidates.first_pass, self.config.strategy, g);
            report.unpaired = pairing_result.unpaired.len();
            units.extend(
                pairing_result
                    .groups
                    .into_iter()
                    .map(|group| TestUnit::first_pass(group, self.config.strategy, now, ttl)),
            );
        }
        report.formed = units.len();

        let admission = self.admission.admit(units, report.in_flight_units, 0);
        report.admitted = admission.admitted.len();
        report.deferred = admission.deferred.len();
        for unit in &admission.admitted {
            debug!(unit = %unit.0, pass = %unit.0.pass, "Unit admitted");
        }

        let reports = self
            .dispatcher
            .dispatch_all(admission.admitted, self.second_pass_active(), now)
            .await;
        for r in &reports {
            tally.add(r, now, recorder.is_dry_run());
        }

        // Confirmatory run for this tick's first-pass failures
        if self.second_pass_active() && !tally.suspects.is_empty() {
            let now = epoch_after(now, started.elapsed());
            let implicated: Vec<Node> = tally
                .suspects
                .iter()
                .filter_map(|name| by_name.get(name.as_str()).map(|n| (*n).clone()))
                .collect();
            let plan = {
                let mut pairing = self.pairing.lock().await;
                let healthy = self.healthy_pool(&view, &tally, now);
                self.second_pass
                    .plan(&implicated, healthy, pairing.rng(), now, ttl)
            };
            report.second_pass_units += plan.units.len();

            let admission = self
                .admission
                .admit(plan.units, report.in_flight_units, report.admitted);
            report.admitted += admission.admitted.len();
            report.deferred += admission.deferred.len();

            let reports = self.dispatcher.dispatch_all(admission.admitted, false, now).await;
            for r in &reports {
                tally.add(r, now, recorder.is_dry_run());
            }
        }

        let combined = combine_verdicts(
            &tally.first_passed,
            &tally.first_failed,
            &tally.second_passed,
            &tally.second_failed,
        );
        let mut failed = combined.failed;
        failed.extend(finalized);
        let suspect: BTreeSet<String> = combined
            .pending
            .into_iter()
            .filter(|n| tally.suspects.contains(n))
            .collect();
        // Confirmed failures that never got a second pass are final already
        failed.extend(
            tally
                .first_failed
                .iter()
                .filter(|n| !tally.suspects.contains(*n))
                .cloned(),
        );

        for (value, count) in &tally.taints {
            self.metrics.inc_taints_applied(value, *count);
        }

        report.passed = combined.passed.into_iter().collect();
        report.failed = failed.into_iter().collect();
        report.suspect = suspect.into_iter().collect();
        report.timed_out = tally.timed_out.into_iter().collect();
        report.inconclusive = tally.inconclusive.into_iter().collect();

        info!(
            eligible = report.eligible,
            formed = report.formed,
            admitted = report.admitted,
            deferred = report.deferred,
            second_pass_units = report.second_pass_units,
            passed = report.passed.len(),
            failed = report.failed.len(),
            suspect = report.suspect.len(),
            timed_out = report.timed_out.len(),
            inconclusive = report.inconclusive.len(),
            duration = ?started.elapsed(),
            "Tick complete"
        );
        Ok(report)
    }

    /// Provisional failure older than the second pass timeout. The failing
    /// run's timestamp is the node's runtime label; without one the node has
    /// nothing to wait for.
    fn waited_out(&self, node: &Node, now: i64) -> bool {
        node.runtime(&self.schema).map_or(true, |failed_at| {
            now.saturating_sub(failed_at) >= self.config.second_pass_timeout_secs()
        })
    }

    /// Nodes that may serve as reference partners: passed earlier and still
    /// valid, or passed during this tick
    fn healthy_pool(&self, view: &[Node], tally: &Tally, now: i64) -> Vec<HealthyNode> {
        let failed_taint = self.dispatcher.recorder().taints().failed();
        let mut pool: BTreeMap<String, HealthyNode> = BTreeMap::new();

        for node in view {
            if tally.first_failed.contains(&node.name) || tally.second_failed.contains(&node.name) {
                continue;
            }
            if let Some(passed_at) = tally.passed_at.get(&node.name) {
                pool.insert(
                    node.name.clone(),
                    HealthyNode::new(&node.name, node.topology.clone(), *passed_at),
                );
                continue;
            }
            let usable = node.is_ready(&self.schema)
                && node.test_state(&self.schema, &failed_taint, now) == TestState::Passed;
            if usable {
                let passed_at = node
                    .runtime(&self.schema)
                    .or_else(|| {
                        node.valid_till(&self.schema)
                            .map(|till| till.saturating_sub(self.config.health_validity_secs()))
                    })
                    .unwrap_or(0);
                pool.insert(
                    node.name.clone(),
                    HealthyNode::new(&node.name, node.topology.clone(), passed_at),
                );
            }
        }
        pool.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::executor::MockExecutor;
    use crate::labels::Verdict;
    use crate::pairing::PairingStrategy;
    use crate::registry::MemoryRegistry;

    const NOW: i64 = 1_700_000_000;

    fn opted_in(name: &str) -> Node {
        let schema = LabelSchema::default();
        Node::new(name).with_label(schema.test_marker_key(), schema.test_marker_value())
    }

    fn blast(limit: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            blast_mode_enabled: true,
            blast_mode_limit: limit,
            seed: Some(11),
            ..Default::default()
        }
    }

    fn setup(
        config: OrchestratorConfig,
        nodes: Vec<Node>,
    ) -> (Orchestrator, Arc<MemoryRegistry>, Arc<MockExecutor>) {
        let registry = Arc::new(MemoryRegistry::with_nodes(nodes));
        let executor = Arc::new(MockExecutor::new());
        let orchestrator = Orchestrator::new(config, registry.clone(), executor.clone()).unwrap();
        (orchestrator, registry, executor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_pass_clears_partner_blamed_nodes() {
        let nodes = ["a", "b", "c", "d"].iter().map(|n| opted_in(n)).collect();
        let (orchestrator, registry, executor) = setup(blast(4), nodes);
        executor.fail_first_pass("a").await;
        executor.fail_first_pass("b").await;

        let report = orchestrator.tick_at(NOW).await.unwrap();
        assert_eq!(report.second_pass_units, 2);
        assert_eq!(report.passed, vec!["a", "b", "c", "d"]);
        assert!(report.failed.is_empty());

        let specs = executor.submitted().await;
        let second: Vec<_> = specs.iter().filter(|s| s.second_pass).collect();
        assert_eq!(second.len(), 2);
        let partners: BTreeSet<_> = second.iter().map(|s| s.nodes[1].clone()).collect();
        assert_eq!(partners, BTreeSet::from(["c".to_string(), "d".to_string()]));

        let schema = LabelSchema::default();
        for name in ["a", "b"] {
            let node = registry.node(name).await.unwrap();
            assert_eq!(node.verdict(&schema), Some(Verdict::Pass));
            assert!(!node.needs_second_pass(&schema));
            assert!(node.taints.is_empty());
        }
    }

    fn two_racks() -> Vec<Node> {
        vec![
            opted_in("a").with_rack("r1"),
            opted_in("b").with_rack("r1"),
            opted_in("c").with_rack("r2"),
            opted_in("d").with_rack("r2"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pair_disambiguated() {
        let config = OrchestratorConfig {
            strategy: PairingStrategy::IntraRack,
            ..blast(4)
        };
        let (orchestrator, registry, executor) = setup(config, two_racks());
        executor.fail_always("a").await;
        executor.set_attribute_failures(false).await;

        let report = orchestrator.tick_at(NOW).await.unwrap();
        assert_eq!(report.failed, vec!["a"]);
        assert_eq!(report.passed, vec!["b", "c", "d"]);

        let schema = LabelSchema::default();
        let a = registry.node("a").await.unwrap();
        assert_eq!(a.verdict(&schema), Some(Verdict::Fail));
        assert!(!a.needs_second_pass(&schema));
        assert_eq!(a.taints.len(), 1);
        assert_eq!(a.taints[0].value, "failed");
        assert_eq!(a.taints[0].effect, crate::node::TaintEffect::NoSchedule);

        let b = registry.node("b").await.unwrap();
        assert_eq!(b.verdict(&schema), Some(Verdict::Pass));
        assert!(b.taints.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_failed_pair_split_by_second_pass() {
        let nodes = ["a", "b", "c", "d"].iter().map(|n| opted_in(n)).collect();
        let (orchestrator, registry, executor) = setup(blast(4), nodes);
        executor.fail_always("a").await;
        executor.set_attribute_failures(false).await;

        let report = orchestrator.tick_at(NOW).await.unwrap();

        let specs = executor.submitted().await;
        let failed_pair = specs
            .iter()
            .find(|s| !s.second_pass && s.nodes.contains(&"a".to_string()))
            .unwrap();
        let partner = failed_pair.nodes.iter().find(|n| *n != "a").unwrap().clone();

        let retests: Vec<_> = specs.iter().filter(|s| s.second_pass).collect();
        assert_eq!(retests.len(), 2);
        let targets: BTreeSet<_> = retests.iter().map(|s| s.nodes[0].clone()).collect();
        assert_eq!(targets, BTreeSet::from(["a".to_string(), partner.clone()]));
        for spec in &retests {
            assert!(!failed_pair.nodes.contains(&spec.nodes[1]), "retested with a suspect");
        }

        assert_eq!(report.failed, vec!["a"]);
        assert_eq!(report.passed.len(), 3);
        assert!(report.passed.contains(&partner));

        let schema = LabelSchema::default();
        let a = registry.node("a").await.unwrap();
        assert_eq!(a.verdict(&schema), Some(Verdict::Fail));
        assert!(!a.needs_second_pass(&schema));
        assert_eq!(a.taints.len(), 1);
        assert_eq!(a.taints[0].value, "failed");

        let cleared = registry.node(&partner).await.unwrap();
        assert_eq!(cleared.verdict(&schema), Some(Verdict::Pass));
        assert!(!cleared.needs_second_pass(&schema));
        assert!(cleared.taints.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_failure_retested_after_validity() {
        let config = OrchestratorConfig {
            dry_run: true,
            ..blast(4)
        };
        let nodes = ["a", "b", "c", "d"].iter().map(|n| opted_in(n)).collect();
        let (orchestrator, registry, executor) = setup(config, nodes);
        executor.fail_always("a").await;
        executor.set_attribute_failures(false).await;

        let report = orchestrator.tick_at(NOW).await.unwrap();
        assert_eq!(report.failed, vec!["a"]);
        let submitted = executor.submitted().await.len();

        let schema = LabelSchema::default();
        let a = registry.node("a").await.unwrap();
        assert!(a.taints.is_empty());
        assert_eq!(a.verdict(&schema), Some(Verdict::Fail));
        let expiry = a.valid_till(&schema).unwrap();
        assert!(!eligibility::is_eligible(&a, &schema, expiry - 1));

        let report = orchestrator.tick_at(expiry).await.unwrap();
        assert_eq!(report.eligible, 4);
        let specs = executor.submitted().await;
        assert!(specs[submitted..]
            .iter()
            .any(|s| !s.second_pass && s.nodes.contains(&"a".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_records_without_taints() {
        let config = OrchestratorConfig {
            strategy: PairingStrategy::IntraRack,
            dry_run: true,
            ..blast(4)
        };
        let (orchestrator, registry, executor) = setup(config, two_racks());
        executor.fail_always("a").await;
        executor.set_attribute_failures(false).await;

        let report = orchestrator.tick_at(NOW).await.unwrap();
        assert_eq!(report.failed, vec!["a"]);

        let schema = LabelSchema::default();
        for node in registry.snapshot().await {
            assert!(node.taints.is_empty(), "{} was tainted", node.name);
            assert!(node.verdict(&schema).is_some());
            assert!(node.label(&schema.metric()).is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_mode_one_unit_per_tick() {
        let nodes = (0..10).map(|i| opted_in(&format!("n{i}"))).collect();
        let config = OrchestratorConfig {
            seed: Some(3),
            ..Default::default()
        };
        let (orchestrator, _registry, executor) = setup(config, nodes);

        let report = orchestrator.tick_at(NOW).await.unwrap();
        assert_eq!(report.formed, 5);
        assert_eq!(report.admitted, 1);
        assert_eq!(report.deferred, 4);
        assert_eq!(executor.submitted().await.len(), 1);
        assert_eq!(executor.max_running(), 1);

        let report = orchestrator.tick_at(NOW + 900).await.unwrap();
        assert_eq!(report.eligible, 8);
        assert_eq!(report.admitted, 1);
        assert_eq!(executor.submitted().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blast_mode_caps_concurrency() {
        let nodes = (0..20).map(|i| opted_in(&format!("n{i:02}"))).collect();
        let (orchestrator, _registry, executor) = setup(blast(3), nodes);

        let report = orchestrator.tick_at(NOW).await.unwrap();
        assert_eq!(report.admitted, 3);
        assert_eq!(report.deferred, 7);
        assert_eq!(executor.max_running(), 3);

        let mut seen = BTreeSet::new();
        for spec in executor.submitted().await {
            for node in spec.nodes {
                assert!(seen.insert(node), "node in two units");
            }
        }
        assert_eq!(seen.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_from_view_counts_against_budget() {
        let schema = LabelSchema::default();
        let busy = |name: &str| {
            opted_in(name)
                .with_label(schema.state(), "running")
                .with_label(schema.deadline(), (NOW + 300).to_string())
        };
        let mut nodes: Vec<Node> = (0..8).map(|i| opted_in(&format!("n{i}"))).collect();
        nodes.push(busy("x1"));
        nodes.push(busy("x2"));
        let (orchestrator, _registry, _executor) = setup(blast(2), nodes);

        let report = orchestrator.tick_at(NOW).await.unwrap();
        assert_eq!(report.in_flight_units, 1);
        assert_eq!(report.eligible, 8);
        assert_eq!(report.admitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_node_eligible() {
        let config = OrchestratorConfig {
            sleep_time: Duration::from_secs(120),
            ..blast(2)
        };
        let (orchestrator, registry, executor) = setup(config, vec![opted_in("a"), opted_in("b")]);
        executor.hang("b").await;

        let report = orchestrator.tick_at(NOW).await.unwrap();
        assert_eq!(report.timed_out, vec!["a", "b"]);
        assert!(report.passed.is_empty());

        let schema = LabelSchema::default();
        let a = registry.node("a").await.unwrap();
        assert!(a.verdict(&schema).is_none());
        assert!(a.valid_till(&schema).is_none());
        assert!(eligibility::is_eligible(&a, &schema, NOW + 200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validity_window_respected() {
        let (orchestrator, _registry, executor) = setup(blast(4), vec![opted_in("a"), opted_in("b")]);
        orchestrator.tick_at(NOW).await.unwrap();
        assert_eq!(executor.submitted().await.len(), 1);

        let expiry = NOW + 60 + 24 * 3600;
        let report = orchestrator.tick_at(expiry - 1).await.unwrap();
        assert_eq!(report.eligible, 0);

        let report = orchestrator.tick_at(expiry).await.unwrap();
        assert_eq!(report.eligible, 2);
        assert_eq!(executor.submitted().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_carry_over_retested_before_new_work() {
        let schema = LabelSchema::default();
        let nodes = vec![
            opted_in("marked")
                .with_label(schema.result(), "fail")
                .with_label(schema.valid_till(), (NOW + 3600).to_string())
                .with_label(schema.second_pass_needed(), "true"),
            opted_in("healthy")
                .with_label(schema.result(), "pass")
                .with_label(schema.valid_till(), (NOW + 3600).to_string())
                .with_label(schema.runtime(), (NOW - 60).to_string()),
            opted_in("new1"),
            opted_in("new2"),
        ];
        let config = OrchestratorConfig {
            seed: Some(5),
            ..Default::default()
        };
        let (orchestrator, registry, executor) = setup(config, nodes);

        let report = orchestrator.tick_at(NOW).await.unwrap();
        assert_eq!(report.carry_over, 1);
        assert_eq!(report.admitted, 1);

        let specs = executor.submitted().await;
        assert_eq!(specs.len(), 1);
        assert!(specs[0].second_pass);
        assert_eq!(specs[0].nodes, vec!["marked", "healthy"]);

        let marked = registry.node("marked").await.unwrap();
        assert_eq!(marked.verdict(&schema), Some(Verdict::Pass));
        assert!(!marked.needs_second_pass(&schema));
        // Partner verdict untouched
        let healthy = registry.node("healthy").await.unwrap();
        assert_eq!(healthy.runtime(&schema), Some(NOW - 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_carry_over_without_partner_is_finalized() {
        let schema = LabelSchema::default();
        let nodes = vec![opted_in("marked")
            .with_label(schema.result(), "fail")
            .with_label(schema.second_pass_needed(), "true")];
        let (orchestrator, registry, executor) = setup(blast(2), nodes);

        let report = orchestrator.tick_at(NOW).await.unwrap();
        assert_eq!(report.failed, vec!["marked"]);
        assert!(executor.submitted().await.is_empty());

        let marked = registry.node("marked").await.unwrap();
        assert!(!marked.needs_second_pass(&schema));
        assert_eq!(marked.taints[0].value, "failed");
    }

    fn marked_at(failed_at: i64) -> Node {
        let schema = LabelSchema::default();
        opted_in("marked")
            .with_label(schema.result(), "fail")
            .with_label(schema.second_pass_needed(), "true")
            .with_label(schema.runtime(), failed_at.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_carry_over_waits_for_partner_within_timeout() {
        let nodes = vec![marked_at(NOW - 60), opted_in("new1"), opted_in("new2")];
        let (orchestrator, registry, _executor) = setup(OrchestratorConfig::default(), nodes);

        let report = orchestrator.tick_at(NOW).await.unwrap();
        assert!(report.failed.is_empty());

        let schema = LabelSchema::default();
        let marked = registry.node("marked").await.unwrap();
        assert!(marked.needs_second_pass(&schema));
        assert!(marked.taints.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_carry_over_finalized_after_timeout() {
        let config = OrchestratorConfig {
            second_pass_timeout: Duration::from_secs(1800),
            ..Default::default()
        };
        let nodes = vec![marked_at(NOW - 1800), opted_in("new1"), opted_in("new2")];
        let (orchestrator, registry, _executor) = setup(config, nodes);

        let report = orchestrator.tick_at(NOW).await.unwrap();
        assert_eq!(report.failed, vec!["marked"]);

        let schema = LabelSchema::default();
        let marked = registry.node("marked").await.unwrap();
        assert!(!marked.needs_second_pass(&schema));
        assert_eq!(marked.taints[0].value, "failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_defers_second_pass_to_next_tick() {
        let config = OrchestratorConfig {
            strategy: PairingStrategy::IntraRack,
            seed: Some(9),
            ..Default::default()
        };
        let (orchestrator, registry, executor) = setup(config, two_racks());
        executor.fail_first_pass("a").await;
        executor.set_attribute_failures(false).await;

        // Whichever pair goes first, four ticks cover both pairs and both retests
        let mut now = NOW;
        for _ in 0..4 {
            let report = orchestrator.tick_at(now).await.unwrap();
            assert!(report.admitted <= 1);
            assert!(report.failed.is_empty());
            now += 900;
        }
        assert_eq!(executor.max_running(), 1);

        let specs = executor.submitted().await;
        assert_eq!(specs.len(), 4);
        let retests: Vec<_> = specs.iter().filter(|s| s.second_pass).collect();
        assert_eq!(retests.len(), 2);
        for spec in retests {
            assert!(["a", "b"].contains(&spec.nodes[0].as_str()));
            assert!(["c", "d"].contains(&spec.nodes[1].as_str()));
        }

        let schema = LabelSchema::default();
        for node in registry.snapshot().await {
            assert_eq!(node.verdict(&schema), Some(Verdict::Pass), "{}", node.name);
            assert!(!node.needs_second_pass(&schema));
            assert!(node.taints.is_empty());
        }
    }

    #[tokio::test]
    async fn test_registry_unavailable_is_transient() {
        let (orchestrator, registry, _executor) = setup(blast(2), vec![opted_in("a")]);
        registry.set_unavailable(true);

        let err = orchestrator.tick_at(NOW).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TransientScheduling(_)));
        assert!(err.is_transient());

        registry.set_unavailable(false);
        tokio_test::assert_ok!(orchestrator.tick_at(NOW).await);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let registry = Arc::new(MemoryRegistry::new());
        let executor = Arc::new(MockExecutor::new());
        let config = OrchestratorConfig {
            group_size: 0,
            ..Default::default()
        };
        let result = Orchestrator::new(config, registry, executor);
        assert!(matches!(result, Err(OrchestratorError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (orchestrator, _registry, executor) = setup(blast(2), vec![opted_in("a"), opted_in("b")]);
        let (tx, rx) = watch::channel(false);
        let orchestrator = Arc::new(orchestrator);

        let runner = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run(rx).await })
        };
        tokio::time::sleep(Duration::from_secs(90)).await;
        tx.send(true).unwrap();

        tokio_test::assert_ok!(runner.await.unwrap());
        assert_eq!(executor.submitted().await.len(), 1);
    }
}
