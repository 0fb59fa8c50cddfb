//! Admission controller
//!
//! Caps the number of units in flight. The budget is process-local and
//! rebuilt from the registry view on every tick; units still running from
//! an earlier tick or another instance are counted through their in-flight
//! labels.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::labels::LabelSchema;
use crate::node::Node;
use crate::pairing::TestUnit;

/// How many units may run at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionMode {
    /// One unit per tick, and none while another is in flight
    Serial,
    /// Up to `limit` units in flight
    Blast { limit: usize },
}

impl AdmissionMode {
    pub fn limit(&self) -> usize {
        match self {
            AdmissionMode::Serial => 1,
            AdmissionMode::Blast { limit } => *limit,
        }
    }
}

/// Shared in-flight counter. Acquisition is a compare-and-swap so the limit
/// holds even when permits are taken from several tasks.
#[derive(Debug)]
pub struct ConcurrencyBudget {
    limit: usize,
    in_use: AtomicUsize,
}

impl ConcurrencyBudget {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            in_use: AtomicUsize::new(0),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Take one slot, counting `external` slots held outside this process
    pub fn try_acquire(self: &Arc<Self>, external: usize) -> Option<BudgetPermit> {
        self.in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used + external < self.limit).then_some(used + 1)
            })
            .ok()
            .map(|_| BudgetPermit {
                budget: Arc::clone(self),
            })
    }
}

/// One budget slot, released on drop
#[derive(Debug)]
pub struct BudgetPermit {
    budget: Arc<ConcurrencyBudget>,
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.budget.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Units admitted this round, each holding its permit
#[derive(Debug, Default)]
pub struct Admission {
    pub admitted: Vec<(TestUnit, BudgetPermit)>,
    pub deferred: Vec<TestUnit>,
}

pub struct AdmissionController {
    mode: AdmissionMode,
    budget: Arc<ConcurrencyBudget>,
}

impl AdmissionController {
    pub fn new(mode: AdmissionMode) -> Self {
        Self {
            mode,
            budget: ConcurrencyBudget::new(mode.limit()),
        }
    }

    pub fn mode(&self) -> AdmissionMode {
        self.mode
    }

    pub fn budget(&self) -> &Arc<ConcurrencyBudget> {
        &self.budget
    }

    /// Admit units in formation order.
    ///
    /// `in_flight_units` comes from the registry view read at the start of the
    /// tick; `admitted_this_tick` counts units already admitted earlier in the
    /// same tick.
    pub fn admit(
        &self,
        units: Vec<TestUnit>,
        in_flight_units: usize,
        admitted_this_tick: usize,
    ) -> Admission {
        let mut admission = Admission::default();
        let serial = matches!(self.mode, AdmissionMode::Serial);
        let serial_blocked = admitted_this_tick > 0 || in_flight_units > 0;

        for unit in units {
            if serial && (serial_blocked || !admission.admitted.is_empty()) {
                admission.deferred.push(unit);
                continue;
            }
            match self.budget.try_acquire(in_flight_units) {
                Some(permit) => admission.admitted.push((unit, permit)),
                None => admission.deferred.push(unit),
            }
        }

        if !admission.deferred.is_empty() {
            tracing::debug!(
                admitted = admission.admitted.len(),
                deferred = admission.deferred.len(),
                in_flight = in_flight_units,
                limit = self.budget.limit(),
                "Admission limit reached"
            );
        }
        admission
    }
}

/// Number of units holding nodes according to the registry view
pub fn in_flight_units(view: &[Node], schema: &LabelSchema, now: i64, group_size: usize) -> usize {
    let nodes = view
        .iter()
        .filter(|n| n.in_flight(schema, now).is_some())
        .count();
    nodes.div_ceil(group_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::PairingStrategy;

    fn units(count: usize) -> Vec<TestUnit> {
        (0..count)
            .map(|i| {
                TestUnit::first_pass(
                    vec![format!("a{i}"), format!("b{i}")],
                    PairingStrategy::Random,
                    0,
                    600,
                )
            })
            .collect()
    }

    #[test]
    fn test_serial_admits_one() {
        let controller = AdmissionController::new(AdmissionMode::Serial);
        let admission = controller.admit(units(5), 0, 0);
        assert_eq!(admission.admitted.len(), 1);
        assert_eq!(admission.deferred.len(), 4);
    }

    #[test]
    fn test_serial_blocked_by_in_flight_or_earlier_admission() {
        let controller = AdmissionController::new(AdmissionMode::Serial);
        assert!(controller.admit(units(2), 1, 0).admitted.is_empty());
        assert!(controller.admit(units(2), 0, 1).admitted.is_empty());
    }

    #[test]
    fn test_blast_respects_limit() {
        let controller = AdmissionController::new(AdmissionMode::Blast { limit: 3 });
        let first = controller.admit(units(5), 1, 0);
        assert_eq!(first.admitted.len(), 2);
        assert_eq!(first.deferred.len(), 3);
        assert_eq!(controller.budget().in_use(), 2);

        // Permits still held, nothing left this round
        let second = controller.admit(units(2), 1, 2);
        assert!(second.admitted.is_empty());

        drop(first);
        assert_eq!(controller.budget().in_use(), 0);
        assert_eq!(controller.admit(units(5), 0, 0).admitted.len(), 3);
    }

    #[test]
    fn test_formation_order_kept() {
        let controller = AdmissionController::new(AdmissionMode::Blast { limit: 2 });
        let formed = units(4);
        let ids: Vec<_> = formed.iter().map(|u| u.id.clone()).collect();
        let admission = controller.admit(formed, 0, 0);
        let admitted: Vec<_> = admission.admitted.iter().map(|(u, _)| u.id.clone()).collect();
        assert_eq!(admitted, ids[..2].to_vec());
    }

    #[test]
    fn test_budget_never_exceeds_limit_across_threads() {
        let budget = ConcurrencyBudget::new(4);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let budget = Arc::clone(&budget);
                std::thread::spawn(move || budget.try_acquire(0))
            })
            .collect();
        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 4);
        assert_eq!(budget.in_use(), 4);
    }

    #[test]
    fn test_in_flight_units_from_view() {
        let schema = LabelSchema::default();
        let view = vec![
            Node::new("a")
                .with_label(schema.state(), "running")
                .with_label(schema.deadline(), "100"),
            Node::new("b")
                .with_label(schema.state(), "scheduled")
                .with_label(schema.deadline(), "100"),
            Node::new("c")
                .with_label(schema.state(), "running")
                .with_label(schema.deadline(), "10"),
        ];
        assert_eq!(in_flight_units(&view, &schema, 50, 2), 1);
        assert_eq!(in_flight_units(&view, &schema, 5, 2), 2);
        assert_eq!(in_flight_units(&view, &schema, 200, 2), 0);
    }
}
