//! Node registry backed by the Kubernetes API
//!
//! Reads GPU nodes with their labels, taints and topology, and writes labels
//! and taints back.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node as K8sNode;
use tracing::debug;

use hcr_core::node::{Node, NodeTaint, TaintEffect, Topology};
use hcr_core::registry::{apply_with_rollback, NodeWrite, Registry, RegistryError, TaintOp, WriteBatch};

use crate::client::{label_selector, K8sClient};

pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

const RACK_LABELS: [&str; 2] = ["topology.gke.io/rack", "cloud.google.com/gce-topology-subblock"];
const CLUSTER_LABELS: [&str; 2] = ["topology.gke.io/cluster", "cloud.google.com/gce-topology-block"];

/// Map a client error onto the registry taxonomy
pub fn registry_error(err: anyhow::Error) -> RegistryError {
    let message = format!("{:#}", err);
    match err.downcast_ref::<kube::Error>() {
        Some(kube::Error::Api(resp)) if resp.code == 404 => RegistryError::NotFound(message),
        Some(kube::Error::Api(resp)) if resp.code == 409 => RegistryError::Conflict(message),
        Some(kube::Error::Api(resp)) if resp.code >= 500 || resp.code == 429 => {
            RegistryError::Unavailable(message)
        }
        Some(kube::Error::Api(_)) => RegistryError::Other(message),
        Some(_) => RegistryError::Unavailable(message),
        None => RegistryError::Other(message),
    }
}

/// Allocatable GPUs on the node
pub fn gpu_count(node: &K8sNode, resource: &str) -> u64 {
    node.status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get(resource))
        .and_then(|q| q.0.parse::<u64>().ok())
        .unwrap_or(0)
}

fn first_label(labels: &BTreeMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| labels.get(*k))
        .filter(|v| !v.is_empty())
        .cloned()
}

/// Convert an API node to the scheduler's view. Returns `None` for nodes
/// without a name.
pub fn node_from_k8s(node: &K8sNode) -> Option<Node> {
    let name = node.metadata.name.clone()?;
    let labels = node.metadata.labels.clone().unwrap_or_default();

    let topology = Topology::new(
        first_label(&labels, &RACK_LABELS),
        first_label(&labels, &CLUSTER_LABELS),
    );

    let taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| {
            taints
                .iter()
                .filter_map(|t| {
                    let effect = TaintEffect::parse(&t.effect)?;
                    Some(NodeTaint::new(&t.key, t.value.clone().unwrap_or_default(), effect))
                })
                .collect()
        })
        .unwrap_or_default();

    let condition_ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True")
        .unwrap_or(false);
    let cordoned = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);

    Some(Node {
        name,
        topology,
        labels,
        taints,
        ready: condition_ready && !cordoned,
    })
}

/// Registry over Kubernetes node objects
pub struct KubeRegistry {
    client: K8sClient,
    gpu_resource: String,
}

impl KubeRegistry {
    pub fn new(client: K8sClient) -> Self {
        Self {
            client,
            gpu_resource: GPU_RESOURCE.to_string(),
        }
    }

    pub fn with_gpu_resource(mut self, resource: impl Into<String>) -> Self {
        self.gpu_resource = resource.into();
        self
    }

    async fn patch(&self, node: &str, labels: BTreeMap<String, Option<String>>) -> Result<(), RegistryError> {
        self.client
            .patch_labels(node, &labels)
            .await
            .map_err(registry_error)
    }

    async fn current(&self, name: &str) -> Result<Node, RegistryError> {
        let node = self.client.get_node(name).await.map_err(registry_error)?;
        node_from_k8s(&node).ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }
}

#[async_trait]
impl Registry for KubeRegistry {
    async fn list_nodes(&self, filter: &BTreeMap<String, String>) -> Result<Vec<Node>, RegistryError> {
        let items = self
            .client
            .list_nodes(&label_selector(filter))
            .await
            .map_err(registry_error)?;

        let total = items.len();
        let nodes: Vec<Node> = items
            .iter()
            .filter(|n| gpu_count(n, &self.gpu_resource) > 0)
            .filter_map(node_from_k8s)
            .collect();
        debug!(total, gpu_nodes = nodes.len(), "Listed nodes");
        Ok(nodes)
    }

    async fn set_labels(&self, node: &str, labels: &BTreeMap<String, String>) -> Result<(), RegistryError> {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        self.patch(node, labels).await
    }

    async fn remove_labels(&self, node: &str, keys: &[String]) -> Result<(), RegistryError> {
        let labels = keys.iter().map(|k| (k.clone(), None)).collect();
        self.patch(node, labels).await
    }

    async fn set_taint(&self, node: &str, taint: &NodeTaint) -> Result<(), RegistryError> {
        self.client
            .set_taint(node, &taint.key, &taint.value, taint.effect.as_str())
            .await
            .map_err(registry_error)
    }

    async fn remove_taint(&self, node: &str, key: &str) -> Result<(), RegistryError> {
        self.client
            .remove_taint(node, key)
            .await
            .map_err(registry_error)
    }

    /// Label writes for one node go out as a single patch
    async fn apply_node(&self, write: &NodeWrite) -> Result<(), RegistryError> {
        let mut labels: BTreeMap<String, Option<String>> = write
            .set
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        labels.extend(write.remove.iter().map(|k| (k.clone(), None)));
        if !labels.is_empty() {
            self.patch(&write.node, labels).await?;
        }

        match &write.taint {
            Some(TaintOp::Set(taint)) => self.set_taint(&write.node, taint).await,
            Some(TaintOp::Remove(key)) => self.remove_taint(&write.node, key).await,
            None => Ok(()),
        }
    }

    /// Reads every target first so a write that fails part way can be
    /// rolled back to what the nodes carried before
    async fn apply(&self, batch: &WriteBatch) -> Result<(), RegistryError> {
        let mut before = Vec::with_capacity(batch.len());
        for write in &batch.writes {
            before.push(self.current(&write.node).await?);
        }
        apply_with_rollback(self, batch, &before).await
    }
}
