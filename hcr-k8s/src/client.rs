//! Kubernetes Client wrapper
//!
//! Provides the node and job calls the registry and executor need.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Taint};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, info, warn};

const FIELD_MANAGER: &str = "hcr";

/// Attempts for a read-modify-write taint update before giving up
const TAINT_UPDATE_ATTEMPTS: usize = 3;

/// Kubernetes client wrapper
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Create a new K8s client from the in-cluster or kubeconfig environment
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;

        info!("Connected to Kubernetes API server");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Get node API
    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Get jobs API for a namespace
    pub fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Check if the API server is reachable
    pub async fn health_check(&self) -> Result<()> {
        let _ = self
            .nodes()
            .list(&ListParams::default().limit(1))
            .await
            .context("Failed to list nodes")?;
        Ok(())
    }

    /// List nodes matching a label selector (`k=v,k2=v2`, empty for all)
    pub async fn list_nodes(&self, selector: &str) -> Result<Vec<Node>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(selector);
        }
        let nodes = self
            .nodes()
            .list(&params)
            .await
            .with_context(|| format!("Failed to list nodes with selector '{}'", selector))?;
        Ok(nodes.items)
    }

    /// Get a node by name
    pub async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes()
            .get(name)
            .await
            .with_context(|| format!("Failed to get node: {}", name))
    }

    /// Set (`Some`) or remove (`None`) node labels in one merge patch
    pub async fn patch_labels(
        &self,
        node_name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let patch = json!({
            "metadata": {
                "labels": labels
            }
        });

        let params = PatchParams::apply(FIELD_MANAGER);
        self.nodes()
            .patch(node_name, &params, &Patch::Merge(&patch))
            .await
            .with_context(|| format!("Failed to patch labels on node: {}", node_name))?;

        debug!(node = node_name, labels = labels.len(), "Node labels patched");
        Ok(())
    }

    /// Add a taint, replacing any taint with the same key
    pub async fn set_taint(&self, node_name: &str, key: &str, value: &str, effect: &str) -> Result<()> {
        let changed = self
            .update_taints(node_name, |taints| {
                let exists = taints
                    .iter()
                    .any(|t| t.key == key && t.value.as_deref() == Some(value) && t.effect == effect);
                if exists {
                    return false;
                }
                taints.retain(|t| t.key != key);
                taints.push(Taint {
                    key: key.to_string(),
                    value: Some(value.to_string()),
                    effect: effect.to_string(),
                    time_added: None,
                });
                true
            })
            .await?;

        if changed {
            info!(
                node = node_name,
                key = key,
                value = value,
                effect = effect,
                "Taint added to node"
            );
        } else {
            debug!(node = node_name, key = key, "Taint already exists");
        }
        Ok(())
    }

    /// Remove a taint from a node
    pub async fn remove_taint(&self, node_name: &str, key: &str) -> Result<()> {
        let changed = self
            .update_taints(node_name, |taints| {
                let before = taints.len();
                taints.retain(|t| t.key != key);
                taints.len() != before
            })
            .await?;

        if changed {
            info!(node = node_name, key = key, "Taint removed from node");
        }
        Ok(())
    }

    /// Read-modify-write of the taint list guarded by the resource version.
    /// `update` returns false when nothing needs to change.
    async fn update_taints<F>(&self, node_name: &str, update: F) -> Result<bool>
    where
        F: Fn(&mut Vec<Taint>) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let node = self.get_node(node_name).await?;
            let mut taints = node
                .spec
                .as_ref()
                .and_then(|s| s.taints.clone())
                .unwrap_or_default();

            if !update(&mut taints) {
                return Ok(false);
            }

            let patch = json!({
                "metadata": {
                    "resourceVersion": node.metadata.resource_version
                },
                "spec": {
                    "taints": taints
                }
            });

            let params = PatchParams::apply(FIELD_MANAGER);
            match self
                .nodes()
                .patch(node_name, &params, &Patch::Merge(&patch))
                .await
            {
                Ok(_) => return Ok(true),
                Err(kube::Error::Api(resp)) if resp.code == 409 && attempt < TAINT_UPDATE_ATTEMPTS => {
                    warn!(node = node_name, attempt, "Taint update conflicted, retrying");
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to update taints on node: {}", node_name))
                }
            }
        }
    }

    /// Create a job
    pub async fn create_job(&self, namespace: &str, job: &Job) -> Result<()> {
        let name = job.metadata.name.as_deref().unwrap_or_default();
        self.jobs(namespace)
            .create(&PostParams::default(), job)
            .await
            .with_context(|| format!("Failed to create job: {}/{}", namespace, name))?;

        info!(namespace = namespace, job = name, "Job created");
        Ok(())
    }

    /// Get a job, `None` if it no longer exists
    pub async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        self.jobs(namespace)
            .get_opt(name)
            .await
            .with_context(|| format!("Failed to get job: {}/{}", namespace, name))
    }

    /// Delete a job and let the garbage collector remove its pods
    pub async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .jobs(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                info!(namespace = namespace, job = name, "Job deleted");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!(namespace = namespace, job = name, "Job already gone");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to delete job: {}/{}", namespace, name)),
        }
    }
}

/// Render a label selector from key/value pairs
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
