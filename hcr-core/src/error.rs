//! Orchestrator error taxonomy
//!
//! Timeouts are outcomes, not errors, and never appear here.

use thiserror::Error;

use crate::config::ConfigError;
use crate::executor::ExecutorError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Registry unreachable; the tick is abandoned and retried on the next one
    #[error("Transient scheduling error: {0}")]
    TransientScheduling(#[from] RegistryError),

    /// A workload crashed or produced unreadable output. Scoped to one unit.
    #[error("Workload execution failed for unit {unit}: {source}")]
    WorkloadExecution {
        unit: String,
        #[source]
        source: ExecutorError,
    },

    /// Invalid mode or group size, fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl OrchestratorError {
    /// Whether the next tick may succeed without operator action
    pub fn is_transient(&self) -> bool {
        !matches!(self, OrchestratorError::Configuration(_))
    }
}
