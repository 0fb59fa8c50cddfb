//! Workload executor abstraction
//!
//! The orchestrator never runs a diagnostic itself. It hands units to an
//! executor and interprets what comes back.

mod interface;
mod mock;

pub use interface::*;
pub use mock::{MockBehavior, MockExecutor};
