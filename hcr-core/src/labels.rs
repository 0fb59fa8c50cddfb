//! Node label schema
//!
//! Every piece of orchestrator state lives in node labels. This module owns the
//! label keys and the string codecs used at the registry boundary; the rest of
//! the crate works with the typed values.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default prefix shared by all health check labels and the taint key
pub const DEFAULT_LABEL_PREFIX: &str = "aiinfra/nccl-healthcheck";

/// Value the eligibility marker must carry by default
pub const DEFAULT_TEST_MARKER_VALUE: &str = "true";

/// Kubernetes qualified label name: optional DNS subdomain prefix, then a name
static LABEL_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$",
    )
    .expect("label key regex is valid")
});

/// Check a label key against the Kubernetes naming rules
pub fn is_valid_label_key(key: &str) -> bool {
    let name_len = key.rsplit('/').next().map_or(0, str::len);
    name_len <= 63 && LABEL_KEY_RE.is_match(key)
}

/// Label keys used by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSchema {
    prefix: String,
    test_marker_key: String,
    test_marker_value: String,
    not_ready_key: String,
}

impl LabelSchema {
    /// Schema with every key derived from `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            test_marker_key: format!("{prefix}-test"),
            test_marker_value: DEFAULT_TEST_MARKER_VALUE.to_string(),
            not_ready_key: format!("{prefix}-not-ready"),
            prefix,
        }
    }

    /// Override the opt-in marker (FILTER_LABEL_NAME / FILTER_LABEL_VALUE)
    pub fn with_test_marker(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.test_marker_key = key.into();
        self.test_marker_value = value.into();
        self
    }

    /// Override the not-ready marker key
    pub fn with_not_ready_key(mut self, key: impl Into<String>) -> Self {
        self.not_ready_key = key.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn test_marker_key(&self) -> &str {
        &self.test_marker_key
    }

    pub fn test_marker_value(&self) -> &str {
        &self.test_marker_value
    }

    pub fn not_ready_key(&self) -> &str {
        &self.not_ready_key
    }

    /// Epoch seconds until which the last result stays valid
    pub fn valid_till(&self) -> String {
        format!("{}-valid-till-sec", self.prefix)
    }

    /// `pass` / `fail`
    pub fn result(&self) -> String {
        format!("{}-result", self.prefix)
    }

    /// Per-node result written by the workload itself
    pub fn pre_result(&self) -> String {
        format!("{}-pre-result", self.prefix)
    }

    pub fn metric(&self) -> String {
        format!("{}-bandwidth", self.prefix)
    }

    /// Presence-only marker for nodes awaiting a confirmatory run
    pub fn second_pass_needed(&self) -> String {
        format!("{}-second-pass-needed", self.prefix)
    }

    /// Epoch seconds of the last recorded run
    pub fn runtime(&self) -> String {
        format!("{}-runtime-sec", self.prefix)
    }

    /// `scheduled` / `running` while a unit holds the node
    pub fn state(&self) -> String {
        format!("{}-state", self.prefix)
    }

    /// Epoch seconds after which an in-flight marker is stale
    pub fn deadline(&self) -> String {
        format!("{}-deadline-sec", self.prefix)
    }

    /// Labels removed whenever a unit releases its nodes
    pub fn in_flight_keys(&self) -> Vec<String> {
        vec![self.state(), self.deadline()]
    }

    /// Check that every key is a legal Kubernetes label name
    pub fn invalid_keys(&self) -> Vec<String> {
        [
            self.test_marker_key.clone(),
            self.not_ready_key.clone(),
            self.valid_till(),
            self.result(),
            self.pre_result(),
            self.metric(),
            self.second_pass_needed(),
            self.runtime(),
            self.state(),
            self.deadline(),
        ]
        .into_iter()
        .filter(|key| !is_valid_label_key(key))
        .collect()
    }
}

impl Default for LabelSchema {
    fn default() -> Self {
        Self::new(DEFAULT_LABEL_PREFIX)
    }
}

/// Pass/fail verdict as stored in the result label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn as_label(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(Verdict::Pass),
            "fail" => Ok(Verdict::Fail),
            other => Err(format!("unknown verdict label value: {other}")),
        }
    }
}

/// In-flight marker stored in the state label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InFlight {
    Scheduled,
    Running,
}

impl InFlight {
    pub fn as_label(&self) -> &'static str {
        match self {
            InFlight::Scheduled => "scheduled",
            InFlight::Running => "running",
        }
    }
}

impl FromStr for InFlight {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(InFlight::Scheduled),
            "running" => Ok(InFlight::Running),
            other => Err(format!("unknown state label value: {other}")),
        }
    }
}

/// Encode a non-negative metric as a label value, rounded to two decimals.
/// Label values must start and end with an alphanumeric character, so
/// negative metrics have no encoding.
pub fn encode_metric(value: f64) -> Option<String> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let rounded = (value * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        Some(format!("{}", rounded as i64))
    } else {
        Some(format!("{rounded:.2}"))
    }
}

pub fn decode_epoch(value: &str) -> Option<i64> {
    value.trim().parse().ok()
}

/// `now` plus `elapsed`, saturating at `i64::MAX`
pub fn epoch_after(now: i64, elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_secs())
        .ok()
        .and_then(|secs| now.checked_add(secs))
        .unwrap_or(i64::MAX)
}
