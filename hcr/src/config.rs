//! Configuration module for HCR
//!
//! Handles loading and validating configuration from YAML files.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use hcr_core::config::OrchestratorConfig;
use hcr_core::executor::WorkloadKind;
use hcr_core::labels::DEFAULT_LABEL_PREFIX;
use hcr_core::pairing::PairingStrategy;
use hcr_core::second_pass::SecondPassPolicy;

/// Node label settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelsConfig {
    /// Prefix of every label and of the taint key
    #[serde(default = "default_label_prefix")]
    pub prefix: String,

    /// Opt-in label name; defaults to `<prefix>-test`
    #[serde(default)]
    pub filter_label_name: Option<String>,

    /// Opt-in label value; defaults to `true`
    #[serde(default)]
    pub filter_label_value: Option<String>,

    /// Label marking a node not ready; defaults to `<prefix>-not-ready`
    #[serde(default)]
    pub not_ready_label: Option<String>,
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            prefix: default_label_prefix(),
            filter_label_name: None,
            filter_label_value: None,
            not_ready_label: None,
        }
    }
}

/// Kubernetes executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Namespace the health check jobs run in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Path to the Job YAML template
    #[serde(default = "default_job_template")]
    pub job_template: String,

    /// Interval between job status polls
    #[serde(with = "humantime_serde", default = "default_check_interval")]
    pub check_interval: Duration,

    /// Extended resource identifying GPU nodes
    #[serde(default = "default_gpu_resource")]
    pub gpu_resource: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            job_template: default_job_template(),
            check_interval: default_check_interval(),
            gpu_resource: default_gpu_resource(),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port to expose metrics on
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pairing strategy (random, intra_rack, inter_rack, inter_cluster)
    #[serde(default)]
    pub pairing_mode: PairingStrategy,

    /// Nodes per test unit
    #[serde(default = "default_group_size")]
    pub nodes_per_test: usize,

    /// Workload kind (nccl, neper, gpu)
    #[serde(default)]
    pub workload: WorkloadKind,

    /// Extra environment handed to every workload
    #[serde(default)]
    pub workload_params: BTreeMap<String, String>,

    #[serde(default = "default_true")]
    pub second_pass_enabled: bool,

    /// How second-pass partner domains are chosen
    #[serde(default)]
    pub second_pass_policy: SecondPassPolicy,

    /// How long a provisional failure waits for a healthy partner
    #[serde(with = "humantime_serde", default = "default_second_pass_timeout")]
    pub second_pass_timeout: Duration,

    /// Run many units at once instead of one at a time
    #[serde(default)]
    pub blast_mode_enabled: bool,

    /// Concurrent unit limit in blast mode
    #[serde(default = "default_blast_mode_limit")]
    pub blast_mode_limit: usize,

    /// Deadline of a single test unit
    #[serde(with = "humantime_serde", default = "default_sleep_time")]
    pub sleep_time: Duration,

    /// How long a result stays valid
    #[serde(with = "humantime_serde", default = "default_health_validity")]
    pub health_validity: Duration,

    /// Interval between scheduling ticks
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,

    /// Seed for reproducible pairings
    #[serde(default)]
    pub seed: Option<u64>,

    /// Delete jobs that exceed their deadline
    #[serde(default = "default_true")]
    pub cleanup_on_timeout: bool,

    #[serde(default)]
    pub labels: LabelsConfig,

    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Dry run mode - record results but never taint nodes
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pairing_mode: PairingStrategy::default(),
            nodes_per_test: default_group_size(),
            workload: WorkloadKind::default(),
            workload_params: BTreeMap::new(),
            second_pass_enabled: true,
            second_pass_policy: SecondPassPolicy::default(),
            second_pass_timeout: default_second_pass_timeout(),
            blast_mode_enabled: false,
            blast_mode_limit: default_blast_mode_limit(),
            sleep_time: default_sleep_time(),
            health_validity: default_health_validity(),
            tick_interval: default_tick_interval(),
            seed: None,
            cleanup_on_timeout: true,
            labels: LabelsConfig::default(),
            kubernetes: KubernetesConfig::default(),
            metrics: MetricsConfig::default(),
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Settings handed to the orchestrator
    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        let filter_label = self.labels.filter_label_name.as_ref().map(|name| {
            let value = self
                .labels
                .filter_label_value
                .clone()
                .unwrap_or_else(|| "true".to_string());
            (name.clone(), value)
        });

        OrchestratorConfig {
            strategy: self.pairing_mode,
            group_size: self.nodes_per_test,
            workload: self.workload,
            workload_params: self.workload_params.clone(),
            second_pass_enabled: self.second_pass_enabled,
            second_pass_policy: self.second_pass_policy,
            second_pass_timeout: self.second_pass_timeout,
            dry_run: self.dry_run,
            sleep_time: self.sleep_time,
            health_validity: self.health_validity,
            blast_mode_enabled: self.blast_mode_enabled,
            blast_mode_limit: self.blast_mode_limit,
            tick_interval: self.tick_interval,
            label_prefix: self.labels.prefix.clone(),
            filter_label,
            not_ready_label: self.labels.not_ready_label.clone(),
            seed: self.seed,
            cleanup_on_timeout: self.cleanup_on_timeout,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.labels.filter_label_value.is_some() && self.labels.filter_label_name.is_none() {
            anyhow::bail!("labels.filter_label_value requires labels.filter_label_name");
        }
        if self.kubernetes.namespace.is_empty() {
            anyhow::bail!("kubernetes.namespace must not be empty");
        }
        if self.kubernetes.check_interval.is_zero() {
            anyhow::bail!("kubernetes.check_interval must be > 0");
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        self.to_orchestrator_config()
            .validate()
            .context("Invalid scheduling settings")?;
        Ok(())
    }
}

// Default value functions
fn default_label_prefix() -> String {
    DEFAULT_LABEL_PREFIX.to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_job_template() -> String {
    "/etc/hcr/job.yaml".to_string()
}

fn default_check_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_gpu_resource() -> String {
    "nvidia.com/gpu".to_string()
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_true() -> bool {
    true
}

fn default_group_size() -> usize {
    WorkloadKind::default().default_group_size()
}

fn default_second_pass_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_blast_mode_limit() -> usize {
    1
}

fn default_sleep_time() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_health_validity() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

#[cfg(test)]
mod tests {
    use hcr_core::admission::AdmissionMode;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.to_orchestrator_config(), OrchestratorConfig::default());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
pairing_mode: inter_cluster
nodes_per_test: 2
workload: nccl
workload_params:
  NCCL_BENCHMARK: all_gather_perf
second_pass_policy: first
second_pass_timeout: 30m
blast_mode_enabled: true
blast_mode_limit: 8
sleep_time: 15m
health_validity: 12h
tick_interval: 2m
seed: 42

labels:
  prefix: aiinfra/nccl-healthcheck
  filter_label_name: pool
  filter_label_value: a3

kubernetes:
  namespace: health
  job_template: /etc/hcr/nccl.yaml
  check_interval: 30s

metrics:
  enabled: true
  port: 9100
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.pairing_mode, PairingStrategy::InterCluster);
        assert_eq!(config.sleep_time, Duration::from_secs(900));
        assert_eq!(config.kubernetes.check_interval, Duration::from_secs(30));
        assert!(config.validate().is_ok());

        let orchestrator = config.to_orchestrator_config();
        assert_eq!(orchestrator.admission_mode(), AdmissionMode::Blast { limit: 8 });
        assert_eq!(orchestrator.second_pass_policy, SecondPassPolicy::First);
        assert_eq!(orchestrator.second_pass_timeout, Duration::from_secs(1800));
        assert_eq!(orchestrator.health_validity_hours(), 12);
        assert_eq!(
            orchestrator.filter_label,
            Some(("pool".to_string(), "a3".to_string()))
        );
    }

    #[test]
    fn test_invalid_scheduling_rejected() {
        let config = Config::from_yaml("pairing_mode: intra_rack\nnodes_per_test: 1\n").unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_yaml("workload: gpu\nnodes_per_test: 2\n").unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_yaml("workload: gpu\nnodes_per_test: 1\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oversized_duration_rejected() {
        let config = Config::from_yaml("health_validity: 1000years\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_filter_value_needs_name() {
        let config = Config::from_yaml("labels:\n  filter_label_value: a3\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_pairing_mode() {
        assert!(Config::from_yaml("pairing_mode: diagonal\n").is_err());
    }
}
