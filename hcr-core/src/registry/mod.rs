//! Node registry abstraction
//!
//! The registry is the only place orchestrator state lives. Kubernetes is the
//! production backend; `MemoryRegistry` backs tests and local runs.

mod interface;
mod memory;

pub use interface::*;
pub use memory::MemoryRegistry;
