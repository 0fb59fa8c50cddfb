//! HCR Kubernetes Integration
//!
//! Kubernetes client, node registry and Job-based workload executor for the
//! GPU cluster health check runner.

pub mod client;
pub mod job_executor;
pub mod registry;

pub use client::K8sClient;
pub use job_executor::JobExecutor;
pub use registry::KubeRegistry;
