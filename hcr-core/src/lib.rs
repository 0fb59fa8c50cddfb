//! HCR Core Library
//!
//! Scheduling logic for the GPU cluster health check runner: node
//! eligibility, topology-aware pairing, admission control, dispatch, result
//! recording and the confirmatory second pass.

pub mod admission;
pub mod config;
pub mod dispatcher;
pub mod eligibility;
pub mod error;
pub mod executor;
pub mod labels;
pub mod metrics;
pub mod node;
pub mod orchestrator;
pub mod pairing;
pub mod recorder;
pub mod registry;
pub mod second_pass;

// Re-export common types
pub use admission::{AdmissionController, AdmissionMode};
pub use config::{ConfigError, OrchestratorConfig};
pub use error::OrchestratorError;
pub use executor::{
    Completion, ExecutorError, UnitResult, WorkloadExecutor, WorkloadHandle, WorkloadKind, WorkloadSpec,
};
pub use labels::{LabelSchema, Verdict};
pub use node::{Node, NodeTaint, TaintEffect, Topology};
pub use orchestrator::{Orchestrator, TickReport};
pub use pairing::{PairingStrategy, TestUnit};
pub use registry::{NodeWrite, Registry, RegistryError, TaintOp, WriteBatch};
pub use second_pass::SecondPassPolicy;
