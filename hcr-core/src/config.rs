//! Orchestrator settings
//!
//! Built by the binary from its YAML file and environment overrides, then
//! validated once at startup.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::admission::AdmissionMode;
use crate::executor::WorkloadKind;
use crate::labels::{LabelSchema, DEFAULT_LABEL_PREFIX};
use crate::pairing::PairingStrategy;
use crate::recorder::TaintPolicy;
use crate::second_pass::SecondPassPolicy;

/// Longest accepted duration setting. Keeps every epoch computation far from
/// `i64` overflow.
pub const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Invalid settings, fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid group size: {0}")]
    GroupSize(String),

    #[error("Invalid pairing mode: {0}")]
    PairingMode(String),

    #[error("Invalid blast mode limit: {0}")]
    BlastLimit(String),

    #[error("Invalid duration: {0}")]
    Duration(String),

    #[error("Invalid label key(s): {}", .0.join(", "))]
    LabelKeys(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub strategy: PairingStrategy,
    /// Nodes per unit (`g`)
    pub group_size: usize,
    pub workload: WorkloadKind,
    /// Passed to every workload as environment
    pub workload_params: BTreeMap<String, String>,
    pub second_pass_enabled: bool,
    pub second_pass_policy: SecondPassPolicy,
    /// How long a provisionally failed node may wait for a healthy partner
    /// before its failure is made final
    pub second_pass_timeout: Duration,
    /// Record results but never write taints
    pub dry_run: bool,
    /// Per-unit deadline
    pub sleep_time: Duration,
    /// How long a result stays valid
    pub health_validity: Duration,
    pub blast_mode_enabled: bool,
    pub blast_mode_limit: usize,
    pub tick_interval: Duration,
    pub label_prefix: String,
    /// Opt-in marker override; defaults to `<prefix>-test=true`
    pub filter_label: Option<(String, String)>,
    pub not_ready_label: Option<String>,
    /// Seed for reproducible pairings
    pub seed: Option<u64>,
    /// Cancel workloads that exceed their deadline
    pub cleanup_on_timeout: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: PairingStrategy::Random,
            group_size: 2,
            workload: WorkloadKind::Nccl,
            workload_params: BTreeMap::new(),
            second_pass_enabled: true,
            second_pass_policy: SecondPassPolicy::UniformRandom,
            second_pass_timeout: Duration::from_secs(3600),
            dry_run: false,
            sleep_time: Duration::from_secs(10 * 60),
            health_validity: Duration::from_secs(24 * 3600),
            blast_mode_enabled: false,
            blast_mode_limit: 1,
            tick_interval: Duration::from_secs(5 * 60),
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
            filter_label: None,
            not_ready_label: None,
            seed: None,
            cleanup_on_timeout: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn schema(&self) -> LabelSchema {
        let mut schema = LabelSchema::new(&self.label_prefix);
        if let Some((key, value)) = &self.filter_label {
            schema = schema.with_test_marker(key, value);
        }
        if let Some(key) = &self.not_ready_label {
            schema = schema.with_not_ready_key(key);
        }
        schema
    }

    pub fn taint_policy(&self) -> TaintPolicy {
        TaintPolicy::for_schema(&self.schema())
    }

    pub fn admission_mode(&self) -> AdmissionMode {
        if self.blast_mode_enabled {
            AdmissionMode::Blast {
                limit: self.blast_mode_limit,
            }
        } else {
            AdmissionMode::Serial
        }
    }

    pub fn sleep_time_secs(&self) -> i64 {
        duration_secs(self.sleep_time)
    }

    pub fn health_validity_secs(&self) -> i64 {
        duration_secs(self.health_validity)
    }

    pub fn second_pass_timeout_secs(&self) -> i64 {
        duration_secs(self.second_pass_timeout)
    }

    pub fn health_validity_hours(&self) -> u64 {
        self.health_validity.as_secs() / 3600
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_size == 0 {
            return Err(ConfigError::GroupSize("must be at least 1".to_string()));
        }
        if self.strategy.is_topology_aware() && self.group_size < 2 {
            return Err(ConfigError::PairingMode(format!(
                "{} requires a group size of at least 2, got {}",
                self.strategy, self.group_size
            )));
        }
        if self.workload.is_multi_node() {
            if self.group_size < 2 {
                return Err(ConfigError::GroupSize(format!(
                    "{} workloads need at least 2 nodes, got {}",
                    self.workload, self.group_size
                )));
            }
        } else if self.group_size != 1 {
            return Err(ConfigError::GroupSize(format!(
                "{} workloads run on a single node, got group size {}",
                self.workload, self.group_size
            )));
        } else if self.strategy != PairingStrategy::Random {
            return Err(ConfigError::PairingMode(format!(
                "{} workloads only support random pairing, got {}",
                self.workload, self.strategy
            )));
        }
        if self.blast_mode_enabled && self.blast_mode_limit == 0 {
            return Err(ConfigError::BlastLimit("must be at least 1 in blast mode".to_string()));
        }
        for (name, value) in [
            ("sleep_time", self.sleep_time),
            ("health_validity", self.health_validity),
            ("tick_interval", self.tick_interval),
            ("second_pass_timeout", self.second_pass_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Duration(format!("{name} must be greater than 0")));
            }
            if value > MAX_DURATION {
                return Err(ConfigError::Duration(format!(
                    "{name} must not exceed {}",
                    humantime::format_duration(MAX_DURATION)
                )));
            }
        }
        let invalid = self.schema().invalid_keys();
        if !invalid.is_empty() {
            return Err(ConfigError::LabelKeys(invalid));
        }
        Ok(())
    }
}

/// Whole seconds as `i64`, saturating at `i64::MAX`
fn duration_secs(value: Duration) -> i64 {
    i64::try_from(value.as_secs()).unwrap_or(i64::MAX)
}
