//! Workload executor running test units as Kubernetes Jobs
//!
//! Each unit becomes one Job rendered from a YAML template. The workload
//! reports back through per-node `-pre-result` and `-bandwidth` labels, which
//! are read once the Job finishes.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::EnvVar;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hcr_core::executor::{
    Completion, ExecutorError, UnitResult, WorkloadExecutor, WorkloadHandle, WorkloadSpec,
};
use hcr_core::labels::LabelSchema;

use crate::client::K8sClient;

pub const JOB_NAME_PREFIX: &str = "chs-hc";
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(20);

const UNIT_LABEL: &str = "hcr/unit";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

static TEMPLATE_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("Failed to compile template variable regex")
});

/// Substitute `$VAR` and `${VAR}` with values from `vars`; unknown variables
/// are left as written
pub fn render_template(template: &str, vars: &BTreeMap<String, String>) -> String {
    TEMPLATE_VAR
        .replace_all(template, |caps: &Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            match vars.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

pub fn job_name(spec: &WorkloadSpec) -> String {
    format!("{}-{}-{}", JOB_NAME_PREFIX, spec.distinctor(), spec.unit_id)
}

/// Build the Job for a unit from the template
pub fn build_job(template: &str, spec: &WorkloadSpec) -> Result<Job> {
    let name = job_name(spec);
    let mut vars = spec.env();
    vars.insert("JOB_NAME".to_string(), name.clone());

    let rendered = render_template(template, &vars);
    let mut job: Job = serde_yaml::from_str(&rendered).context("Failed to parse job template")?;

    job.metadata.name = Some(name);
    let labels = job.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(UNIT_LABEL.to_string(), spec.unit_id.clone());
    labels.insert(MANAGED_BY_LABEL.to_string(), "hcr".to_string());

    let pod_spec = job
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .context("Job template has no pod spec")?;

    for container in pod_spec.containers.iter_mut() {
        let env = container.env.get_or_insert_with(Vec::new);
        for (name, value) in &vars {
            match env.iter_mut().find(|e| &e.name == name) {
                Some(existing) => {
                    existing.value = Some(value.clone());
                    existing.value_from = None;
                }
                None => env.push(EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    value_from: None,
                }),
            }
        }
    }
    Ok(job)
}

/// What one node's labels say about its run
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReport {
    pub node: String,
    pub pre_result: Option<String>,
    pub bandwidth: Option<f64>,
}

/// Read one node's report from its labels
pub fn report_from_labels(node: &str, labels: &BTreeMap<String, String>, schema: &LabelSchema) -> NodeReport {
    NodeReport {
        node: node.to_string(),
        pre_result: labels.get(&schema.pre_result()).cloned(),
        bandwidth: labels
            .get(&schema.metric())
            .and_then(|v| v.parse::<f64>().ok()),
    }
}

/// Label patch removing everything a workload reports, so values from an
/// earlier run cannot be read back as this run's
pub fn stale_report_patch(schema: &LabelSchema) -> BTreeMap<String, Option<String>> {
    BTreeMap::from([(schema.pre_result(), None), (schema.metric(), None)])
}

/// Fold per-node reports into a unit result.
///
/// Each node is judged on its own report. A node reporting anything other
/// than `pass` is implicated; a crashed or silent node is released without a
/// verdict. The unit is inconclusive only when no node gave a definite
/// answer. The unit metric is the lowest bandwidth among definite reports.
pub fn result_from_reports(reports: &[NodeReport]) -> Result<UnitResult, ExecutorError> {
    let mut implicated = Vec::new();
    let mut released = Vec::new();
    let mut metric: Option<f64> = None;
    for report in reports {
        match report.pre_result.as_deref() {
            Some("crash") | None => {
                debug!(node = %report.node, pre_result = ?report.pre_result, "No definite result");
                released.push(report.node.clone());
                continue;
            }
            Some("pass") => {}
            Some(_) => implicated.push(report.node.clone()),
        }
        if let Some(bandwidth) = report.bandwidth {
            metric = Some(metric.map_or(bandwidth, |m| m.min(bandwidth)));
        }
    }

    if released.len() == reports.len() {
        return Err(ExecutorError::Inconclusive(format!(
            "no definite result from {}",
            released.join(", ")
        )));
    }

    let result = if implicated.is_empty() {
        UnitResult::pass(metric)
    } else {
        UnitResult::fail(metric, implicated)
    };
    Ok(result.with_released(released))
}

enum JobState {
    Running,
    Succeeded,
    Failed,
    Missing,
}

fn job_state(job: Option<&Job>) -> JobState {
    let Some(job) = job else {
        return JobState::Missing;
    };
    let status = job.status.as_ref();
    if status.and_then(|s| s.succeeded).unwrap_or(0) >= 1 {
        JobState::Succeeded
    } else if status.and_then(|s| s.failed).unwrap_or(0) >= 1 {
        JobState::Failed
    } else {
        JobState::Running
    }
}

/// Executor creating one Job per unit
pub struct JobExecutor {
    client: K8sClient,
    namespace: String,
    template: String,
    schema: LabelSchema,
    check_interval: Duration,
    /// Nodes of every submitted, unfinished job
    active: RwLock<HashMap<String, Vec<String>>>,
}

impl JobExecutor {
    pub fn new(client: K8sClient, namespace: impl Into<String>, template: impl Into<String>, schema: LabelSchema) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            template: template.into(),
            schema,
            check_interval: DEFAULT_CHECK_INTERVAL,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Load the job template from a file
    pub fn from_template_file(
        client: K8sClient,
        namespace: impl Into<String>,
        path: &str,
        schema: LabelSchema,
    ) -> Result<Self> {
        let template = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job template: {}", path))?;
        Ok(Self::new(client, namespace, template, schema))
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Clear results left by earlier runs so they cannot be mistaken for ours
    async fn clear_pre_results(&self, nodes: &[String]) -> Result<()> {
        let labels = stale_report_patch(&self.schema);
        for node in nodes {
            self.client.patch_labels(node, &labels).await?;
        }
        Ok(())
    }

    async fn read_reports(&self, nodes: &[String]) -> Result<Vec<NodeReport>> {
        let mut reports = Vec::with_capacity(nodes.len());
        for name in nodes {
            let node = self.client.get_node(name).await?;
            let labels = node.metadata.labels.unwrap_or_default();
            reports.push(report_from_labels(name, &labels, &self.schema));
        }
        Ok(reports)
    }
}

#[async_trait]
impl WorkloadExecutor for JobExecutor {
    async fn submit(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, ExecutorError> {
        let job = build_job(&self.template, spec)
            .map_err(|e| ExecutorError::Submit(format!("{:#}", e)))?;
        let name = job.metadata.name.clone().unwrap_or_else(|| job_name(spec));

        self.clear_pre_results(&spec.nodes)
            .await
            .map_err(|e| ExecutorError::Submit(format!("{:#}", e)))?;
        self.client
            .create_job(&self.namespace, &job)
            .await
            .map_err(|e| ExecutorError::Submit(format!("{:#}", e)))?;

        self.active
            .write()
            .await
            .insert(name.clone(), spec.nodes.clone());
        info!(job = %name, nodes = ?spec.nodes, second_pass = spec.second_pass, "Submitted health check job");

        Ok(WorkloadHandle {
            unit_id: spec.unit_id.clone(),
            name,
        })
    }

    async fn await_completion(
        &self,
        handle: &WorkloadHandle,
        deadline: Instant,
    ) -> Result<Completion, ExecutorError> {
        let nodes = self
            .active
            .read()
            .await
            .get(&handle.name)
            .cloned()
            .ok_or_else(|| ExecutorError::Other(format!("unknown workload {}", handle)))?;

        loop {
            match self.client.get_job(&self.namespace, &handle.name).await {
                Ok(job) => match job_state(job.as_ref()) {
                    JobState::Succeeded | JobState::Failed => break,
                    JobState::Missing => {
                        self.active.write().await.remove(&handle.name);
                        return Err(ExecutorError::Inconclusive(format!(
                            "job {} disappeared",
                            handle.name
                        )));
                    }
                    JobState::Running => {}
                },
                Err(e) => warn!(job = %handle.name, error = %format!("{:#}", e), "Failed to poll job"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Completion::TimedOut);
            }
            let wait = self.check_interval.min(deadline - now);
            debug!(job = %handle.name, wait = ?wait, "Job still running");
            tokio::time::sleep(wait).await;
        }

        self.active.write().await.remove(&handle.name);
        let reports = self
            .read_reports(&nodes)
            .await
            .map_err(|e| ExecutorError::Inconclusive(format!("{:#}", e)))?;
        result_from_reports(&reports).map(Completion::Finished)
    }

    async fn cancel(&self, handle: &WorkloadHandle) -> Result<(), ExecutorError> {
        self.active.write().await.remove(&handle.name);
        self.client
            .delete_job(&self.namespace, &handle.name)
            .await
            .map_err(|e| ExecutorError::Cancel(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use hcr_core::executor::WorkloadKind;
    use hcr_core::labels::Verdict;
    use k8s_openapi::api::batch::v1::JobStatus;

    use super::*;

    const TEMPLATE: &str = r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: placeholder
  labels:
    app: nccl-healthcheck
spec:
  completions: 2
  template:
    spec:
      restartPolicy: Never
      containers:
      - name: nccl-test
        image: nccl-healthcheck:latest
        args: ["--peers", "$NODE0,${NODE1}", "--job", "$JOB_NAME"]
        env:
        - name: SECOND_PASS
          value: "unset"
        - name: HOSTNAME_OVERRIDE
          value: "$UNKNOWN_VAR"
"#;

    fn spec(second_pass: bool) -> WorkloadSpec {
        WorkloadSpec {
            unit_id: "1a2b3c4d".to_string(),
            nodes: vec!["gpu-a".to_string(), "gpu-b".to_string()],
            kind: WorkloadKind::Nccl,
            second_pass,
            health_validity_hours: 24,
            params: BTreeMap::from([("NCCL_BENCHMARK".to_string(), "all_gather_perf".to_string())]),
        }
    }

    fn env_value(job: &Job, name: &str) -> Option<String> {
        job.spec.as_ref()?.template.spec.as_ref()?.containers[0]
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .clone()
    }

    #[test]
    fn test_render_template() {
        let vars = BTreeMap::from([("NODE0".to_string(), "a".to_string())]);
        assert_eq!(render_template("x=$NODE0 y=${NODE0} z=$NODE9", &vars), "x=a y=a z=$NODE9");
    }

    #[test]
    fn test_job_name() {
        assert_eq!(job_name(&spec(false)), "chs-hc-nccl-1a2b3c4d");
        assert_eq!(job_name(&spec(true)), "chs-hc-nccl-sp-1a2b3c4d");
    }

    #[test]
    fn test_build_job() {
        let job = build_job(TEMPLATE, &spec(true)).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("chs-hc-nccl-sp-1a2b3c4d"));

        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("nccl-healthcheck"));
        assert_eq!(labels.get(UNIT_LABEL).map(String::as_str), Some("1a2b3c4d"));

        assert_eq!(env_value(&job, "NODE0").as_deref(), Some("gpu-a"));
        assert_eq!(env_value(&job, "NODE1").as_deref(), Some("gpu-b"));
        assert_eq!(env_value(&job, "SECOND_PASS").as_deref(), Some("true"));
        assert_eq!(env_value(&job, "NCCL_BENCHMARK").as_deref(), Some("all_gather_perf"));
        assert_eq!(env_value(&job, "HOSTNAME_OVERRIDE").as_deref(), Some("$UNKNOWN_VAR"));

        let container = &job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        let args = container.args.as_ref().unwrap();
        assert_eq!(args[1], "gpu-a,gpu-b");
        assert_eq!(args[3], "chs-hc-nccl-sp-1a2b3c4d");
    }

    #[test]
    fn test_build_job_rejects_bad_template() {
        assert!(build_job("kind: [", &spec(false)).is_err());
        assert!(build_job("apiVersion: batch/v1\nkind: Job\nmetadata: {}\n", &spec(false)).is_err());
    }

    fn report(node: &str, pre_result: Option<&str>, bandwidth: Option<f64>) -> NodeReport {
        NodeReport {
            node: node.to_string(),
            pre_result: pre_result.map(str::to_string),
            bandwidth,
        }
    }

    #[test]
    fn test_result_pass_uses_lowest_bandwidth() {
        let result = result_from_reports(&[
            report("a", Some("pass"), Some(180.5)),
            report("b", Some("pass"), Some(175.0)),
        ])
        .unwrap();
        assert_eq!(result.verdict, Verdict::Pass);
        assert_eq!(result.metric, Some(175.0));
    }

    #[test]
    fn test_result_fail_implicates_reporters() {
        let result = result_from_reports(&[
            report("a", Some("pass"), Some(180.0)),
            report("b", Some("fail"), None),
        ])
        .unwrap();
        assert_eq!(result.verdict, Verdict::Fail);
        assert_eq!(result.implicated, vec!["b".to_string()]);
        assert_eq!(result.verdict_for("a"), Verdict::Pass);
    }

    #[test]
    fn test_result_without_any_definite_report_is_inconclusive() {
        let crash = result_from_reports(&[report("a", Some("crash"), None), report("b", None, None)]);
        assert!(matches!(crash, Err(ExecutorError::Inconclusive(_))));
    }

    #[test]
    fn test_result_keeps_failure_next_to_silent_node() {
        let result = result_from_reports(&[
            report("a", Some("fail"), Some(12.0)),
            report("b", None, Some(99.0)),
        ])
        .unwrap();
        assert_eq!(result.verdict, Verdict::Fail);
        assert_eq!(result.implicated, vec!["a".to_string()]);
        assert!(result.is_released("b"));
        assert_eq!(result.metric, Some(12.0));

        let result = result_from_reports(&[report("a", Some("pass"), None), report("b", Some("crash"), None)]).unwrap();
        assert_eq!(result.verdict, Verdict::Pass);
        assert!(result.is_released("b"));
        assert!(!result.is_released("a"));
    }

    #[test]
    fn test_leftover_bandwidth_not_read_back() {
        let schema = LabelSchema::default();
        let mut labels = BTreeMap::from([
            (schema.pre_result(), "pass".to_string()),
            (schema.metric(), "180".to_string()),
            ("kubernetes.io/hostname".to_string(), "gpu-a".to_string()),
        ]);

        for (key, value) in stale_report_patch(&schema) {
            match value {
                Some(value) => labels.insert(key, value),
                None => labels.remove(&key),
            };
        }
        // Workload failed before publishing bandwidth
        labels.insert(schema.pre_result(), "fail".to_string());

        let report = report_from_labels("gpu-a", &labels, &schema);
        assert_eq!(report.pre_result.as_deref(), Some("fail"));
        assert_eq!(report.bandwidth, None);
        assert!(labels.contains_key("kubernetes.io/hostname"));
    }

    #[test]
    fn test_job_state() {
        assert!(matches!(job_state(None), JobState::Missing));

        let mut job = Job::default();
        assert!(matches!(job_state(Some(&job)), JobState::Running));

        job.status = Some(JobStatus {
            failed: Some(1),
            ..Default::default()
        });
        assert!(matches!(job_state(Some(&job)), JobState::Failed));

        job.status = Some(JobStatus {
            succeeded: Some(2),
            ..Default::default()
        });
        assert!(matches!(job_state(Some(&job)), JobState::Succeeded));
    }
}
