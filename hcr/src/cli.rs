//! CLI argument parsing for HCR

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::Parser;

use hcr_core::pairing::PairingStrategy;

use crate::config::Config;

/// GPU cluster health check runner - pairs GPU nodes, runs connectivity tests
/// and records verdicts on node labels
#[derive(Debug, Parser)]
#[command(name = "hcr")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/hcr/config.yaml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "HCR_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "HCR_LOG_JSON")]
    pub log_json: bool,

    /// Dry run mode - record results but never taint nodes
    #[arg(long, env = "DRY_RUN")]
    pub dry_run: bool,

    /// Run a single scheduling tick and exit
    #[arg(long)]
    pub once: bool,

    /// Pairing strategy (random, intra_rack, inter_rack, inter_cluster)
    #[arg(long, env = "PAIRING_MODE")]
    pub pairing_mode: Option<PairingStrategy>,

    /// Nodes per test unit
    #[arg(long, env = "NODES_CHECKED_PER_TEST")]
    pub nodes_per_test: Option<usize>,

    /// Enable or disable the confirmatory second pass
    #[arg(long, env = "SECOND_PASS_ENABLED", value_parser = BoolishValueParser::new())]
    pub second_pass_enabled: Option<bool>,

    /// Per-unit deadline in minutes
    #[arg(long, env = "SLEEP_TIME_MINUTES")]
    pub sleep_time_minutes: Option<u64>,

    /// Result validity in hours
    #[arg(long, env = "HEALTH_VALIDITY_HOURS")]
    pub health_validity_hours: Option<u64>,

    /// Run many units concurrently
    #[arg(long, env = "BLAST_MODE_ENABLED", value_parser = BoolishValueParser::new())]
    pub blast_mode_enabled: Option<bool>,

    /// Concurrent unit limit in blast mode
    #[arg(long, env = "BLAST_MODE_NUM_TESTS_LIMIT")]
    pub blast_mode_limit: Option<usize>,

    /// Opt-in label name
    #[arg(long, env = "FILTER_LABEL_NAME")]
    pub filter_label_name: Option<String>,

    /// Opt-in label value
    #[arg(long, env = "FILTER_LABEL_VALUE")]
    pub filter_label_value: Option<String>,

    /// Seed for reproducible pairings
    #[arg(long, env = "PAIRING_SEED")]
    pub seed: Option<u64>,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Apply flags and environment overrides on top of the file config
    pub fn apply_overrides(&self, config: &mut Config) {
        if self.dry_run {
            config.dry_run = true;
        }
        if let Some(mode) = self.pairing_mode {
            config.pairing_mode = mode;
        }
        if let Some(g) = self.nodes_per_test {
            config.nodes_per_test = g;
        }
        if let Some(enabled) = self.second_pass_enabled {
            config.second_pass_enabled = enabled;
        }
        if let Some(minutes) = self.sleep_time_minutes {
            config.sleep_time = Duration::from_secs(minutes * 60);
        }
        if let Some(hours) = self.health_validity_hours {
            config.health_validity = Duration::from_secs(hours * 3600);
        }
        if let Some(enabled) = self.blast_mode_enabled {
            config.blast_mode_enabled = enabled;
        }
        if let Some(limit) = self.blast_mode_limit {
            config.blast_mode_limit = limit;
        }
        if self.filter_label_name.is_some() {
            config.labels.filter_label_name = self.filter_label_name.clone();
        }
        if self.filter_label_value.is_some() {
            config.labels.filter_label_value = self.filter_label_value.clone();
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
    }
}
