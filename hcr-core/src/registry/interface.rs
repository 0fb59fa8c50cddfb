//! Registry trait and write batch types

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::node::{Node, NodeTaint};

/// Errors returned by registry backends
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Backend unreachable; the tick is abandoned and retried
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    /// Node does not exist (deleted between read and write)
    #[error("Node not found: {0}")]
    NotFound(String),

    /// Concurrent modification rejected by the backend
    #[error("Conflicting update on node {0}")]
    Conflict(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Taint change carried by a `NodeWrite`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintOp {
    /// Add the taint, replacing any taint with the same key
    Set(NodeTaint),
    /// Remove the taint with this key
    Remove(String),
}

/// All label and taint changes for one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeWrite {
    pub node: String,
    pub set: BTreeMap<String, String>,
    pub remove: Vec<String>,
    pub taint: Option<TaintOp>,
}

impl NodeWrite {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            ..Default::default()
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.remove.retain(|k| k != &key);
        self.set.insert(key, value.into());
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.set.remove(&key);
        if !self.remove.contains(&key) {
            self.remove.push(key);
        }
        self
    }

    pub fn taint(mut self, op: TaintOp) -> Self {
        self.taint = Some(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty() && self.taint.is_none()
    }

    /// Write that puts every key this write touches back the way `before` had it
    pub fn undo(&self, before: &Node) -> NodeWrite {
        let mut undo = NodeWrite::new(self.node.clone());
        for key in self.set.keys().chain(self.remove.iter()) {
            undo = match before.labels.get(key) {
                Some(value) => undo.set(key.clone(), value.clone()),
                None => undo.remove(key.clone()),
            };
        }
        let taint_key = match &self.taint {
            Some(TaintOp::Set(taint)) => Some(taint.key.as_str()),
            Some(TaintOp::Remove(key)) => Some(key.as_str()),
            None => None,
        };
        if let Some(key) = taint_key {
            undo = match before.taints.iter().find(|t| t.key == key) {
                Some(old) => undo.taint(TaintOp::Set(old.clone())),
                None => undo.taint(TaintOp::Remove(key.to_string())),
            };
        }
        undo
    }
}

/// Writes for every node of one unit, applied together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub writes: Vec<NodeWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: NodeWrite) {
        if !write.is_empty() {
            self.writes.push(write);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn get(&self, node: &str) -> Option<&NodeWrite> {
        self.writes.iter().find(|w| w.node == node)
    }
}

/// Node registry interface
///
/// Implementations must be safe to share between concurrently running units.
#[async_trait]
pub trait Registry: Send + Sync {
    /// List nodes whose labels contain every entry of `filter`
    async fn list_nodes(&self, filter: &BTreeMap<String, String>) -> Result<Vec<Node>, RegistryError>;

    /// Set (or overwrite) labels on a node
    async fn set_labels(
        &self,
        node: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), RegistryError>;

    /// Remove labels from a node. Missing keys are ignored.
    async fn remove_labels(&self, node: &str, keys: &[String]) -> Result<(), RegistryError>;

    /// Add a taint, replacing any existing taint with the same key
    async fn set_taint(&self, node: &str, taint: &NodeTaint) -> Result<(), RegistryError>;

    /// Remove the taint with `key`. A missing taint is not an error.
    async fn remove_taint(&self, node: &str, key: &str) -> Result<(), RegistryError>;

    /// Apply one node's changes
    async fn apply_node(&self, write: &NodeWrite) -> Result<(), RegistryError> {
        if !write.set.is_empty() {
            self.set_labels(&write.node, &write.set).await?;
        }
        if !write.remove.is_empty() {
            self.remove_labels(&write.node, &write.remove).await?;
        }
        match &write.taint {
            Some(TaintOp::Set(taint)) => self.set_taint(&write.node, taint).await?,
            Some(TaintOp::Remove(key)) => self.remove_taint(&write.node, key).await?,
            None => {}
        }
        Ok(())
    }

    /// Apply a batch. The default applies node by node and stops at the first
    /// error; backends that can do better override it.
    async fn apply(&self, batch: &WriteBatch) -> Result<(), RegistryError> {
        for write in &batch.writes {
            self.apply_node(write).await?;
        }
        Ok(())
    }
}

/// Apply `batch` node by node. If a write fails, every node already touched
/// (the failing one included) is written back from `before` and the original
/// error is returned.
pub async fn apply_with_rollback<R: Registry + ?Sized>(
    registry: &R,
    batch: &WriteBatch,
    before: &[Node],
) -> Result<(), RegistryError> {
    for (index, write) in batch.writes.iter().enumerate() {
        let err = match registry.apply_node(write).await {
            Ok(()) => continue,
            Err(err) => err,
        };
        warn!(node = %write.node, error = %err, "Batch write failed, rolling back");
        for done in batch.writes[..=index].iter().rev() {
            let Some(node) = before.iter().find(|n| n.name == done.node) else {
                continue;
            };
            if let Err(undo_err) = registry.apply_node(&done.undo(node)).await {
                warn!(node = %done.node, error = %undo_err, "Rollback write failed");
            }
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TaintEffect;
    use crate::registry::MemoryRegistry;

    /// Memory registry whose writes to one node always fail
    struct FlakyRegistry {
        inner: MemoryRegistry,
        broken: String,
    }

    #[async_trait]
    impl Registry for FlakyRegistry {
        async fn list_nodes(&self, filter: &BTreeMap<String, String>) -> Result<Vec<Node>, RegistryError> {
            self.inner.list_nodes(filter).await
        }

        async fn set_labels(&self, node: &str, labels: &BTreeMap<String, String>) -> Result<(), RegistryError> {
            self.inner.set_labels(node, labels).await
        }

        async fn remove_labels(&self, node: &str, keys: &[String]) -> Result<(), RegistryError> {
            self.inner.remove_labels(node, keys).await
        }

        async fn set_taint(&self, node: &str, taint: &NodeTaint) -> Result<(), RegistryError> {
            self.inner.set_taint(node, taint).await
        }

        async fn remove_taint(&self, node: &str, key: &str) -> Result<(), RegistryError> {
            self.inner.remove_taint(node, key).await
        }

        async fn apply_node(&self, write: &NodeWrite) -> Result<(), RegistryError> {
            if write.node == self.broken {
                return Err(RegistryError::Conflict(write.node.clone()));
            }
            self.inner.apply_node(write).await
        }

        async fn apply(&self, batch: &WriteBatch) -> Result<(), RegistryError> {
            let before = self.inner.snapshot().await;
            apply_with_rollback(self, batch, &before).await
        }
    }

    fn suspect() -> NodeTaint {
        NodeTaint::new("hc", "suspect", TaintEffect::PreferNoSchedule)
    }

    fn failed() -> NodeTaint {
        NodeTaint::new("hc", "failed", TaintEffect::NoSchedule)
    }

    #[test]
    fn test_undo_restores_touched_keys() {
        let mut before = Node::new("a").with_label("state", "running").with_label("keep", "1");
        before.taints.push(suspect());

        let write = NodeWrite::new("a")
            .set("state", "failed")
            .set("valid_till", "100")
            .remove("keep")
            .taint(TaintOp::Set(failed()));
        let undo = write.undo(&before);

        assert_eq!(undo.set.get("state").map(String::as_str), Some("running"));
        assert_eq!(undo.set.get("keep").map(String::as_str), Some("1"));
        assert_eq!(undo.remove, vec!["valid_till".to_string()]);
        assert_eq!(undo.taint, Some(TaintOp::Set(suspect())));

        let clean = Node::new("a");
        let undo = NodeWrite::new("a").taint(TaintOp::Set(failed())).undo(&clean);
        assert_eq!(undo.taint, Some(TaintOp::Remove("hc".to_string())));
        assert!(undo.set.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_rolls_back_written_nodes() {
        let registry = FlakyRegistry {
            inner: MemoryRegistry::with_nodes(vec![
                Node::new("a").with_label("state", "running"),
                Node::new("b").with_label("state", "running"),
            ]),
            broken: "b".to_string(),
        };

        let mut batch = WriteBatch::new();
        for node in ["a", "b"] {
            batch.push(
                NodeWrite::new(node)
                    .set("state", "failed")
                    .set("valid_till", "100")
                    .taint(TaintOp::Set(failed())),
            );
        }

        let result = registry.apply(&batch).await;
        assert!(matches!(result, Err(RegistryError::Conflict(_))));

        let a = registry.inner.node("a").await.unwrap();
        assert_eq!(a.labels.get("state").map(String::as_str), Some("running"));
        assert!(!a.labels.contains_key("valid_till"));
        assert!(a.taints.is_empty());

        let b = registry.inner.node("b").await.unwrap();
        assert_eq!(b.labels.get("state").map(String::as_str), Some("running"));
        assert!(b.taints.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_batch_needs_no_rollback() {
        let registry = MemoryRegistry::with_nodes(vec![Node::new("a")]);
        let before = registry.snapshot().await;
        let mut batch = WriteBatch::new();
        batch.push(NodeWrite::new("a").set("state", "passed"));

        tokio_test::assert_ok!(apply_with_rollback(&registry, &batch, &before).await);
        let a = registry.node("a").await.unwrap();
        assert_eq!(a.labels.get("state").map(String::as_str), Some("passed"));
    }

    #[test]
    fn test_node_write_set_then_remove() {
        let write = NodeWrite::new("a").set("k", "v").remove("k");
        assert!(write.set.is_empty());
        assert_eq!(write.remove, vec!["k".to_string()]);

        let write = NodeWrite::new("a").remove("k").set("k", "v");
        assert!(write.remove.is_empty());
        assert_eq!(write.set.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn test_batch_skips_empty_writes() {
        let mut batch = WriteBatch::new();
        batch.push(NodeWrite::new("a"));
        batch.push(NodeWrite::new("b").taint(TaintOp::Set(NodeTaint::new(
            "k",
            "failed",
            TaintEffect::NoSchedule,
        ))));
        assert_eq!(batch.len(), 1);
        assert!(batch.get("b").is_some());
        assert!(batch.get("a").is_none());
    }
}
