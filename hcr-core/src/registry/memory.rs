//! In-memory registry for testing and local runs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{NodeWrite, Registry, RegistryError, TaintOp, WriteBatch};
use crate::node::{Node, NodeTaint};

/// Registry backed by a map of nodes
pub struct MemoryRegistry {
    nodes: RwLock<BTreeMap<String, Node>>,
    /// Simulated outage: every call fails with `Unavailable`
    unavailable: AtomicBool,
    /// Number of batches applied, for assertions
    batches: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            unavailable: AtomicBool::new(false),
            batches: AtomicUsize::new(0),
        }
    }

    /// Create a registry holding `nodes`
    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let map = nodes
            .into_iter()
            .map(|node| (node.name.clone(), node))
            .collect();
        Self {
            nodes: RwLock::new(map),
            ..Self::new()
        }
    }

    pub async fn insert(&self, node: Node) {
        self.nodes.write().await.insert(node.name.clone(), node);
    }

    /// Set whether every call should fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn batches_applied(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Copy of a single node
    pub async fn node(&self, name: &str) -> Option<Node> {
        self.nodes.read().await.get(name).cloned()
    }

    /// Copy of every node
    pub async fn snapshot(&self) -> Vec<Node> {
        self.nodes.read().await.values().cloned().collect()
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RegistryError::Unavailable("memory registry offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_to(node: &mut Node, write: &NodeWrite) {
    for (key, value) in &write.set {
        node.labels.insert(key.clone(), value.clone());
    }
    for key in &write.remove {
        node.labels.remove(key);
    }
    match &write.taint {
        Some(TaintOp::Set(taint)) => {
            node.taints.retain(|t| t.key != taint.key);
            node.taints.push(taint.clone());
        }
        Some(TaintOp::Remove(key)) => node.taints.retain(|t| &t.key != key),
        None => {}
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn list_nodes(&self, filter: &BTreeMap<String, String>) -> Result<Vec<Node>, RegistryError> {
        self.check_available()?;
        let nodes = self.nodes.read().await;
        Ok(nodes
            .values()
            .filter(|node| filter.iter().all(|(k, v)| node.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn set_labels(
        &self,
        node: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), RegistryError> {
        let mut write = NodeWrite::new(node);
        write.set = labels.clone();
        self.apply_node(&write).await
    }

    async fn remove_labels(&self, node: &str, keys: &[String]) -> Result<(), RegistryError> {
        let mut write = NodeWrite::new(node);
        write.remove = keys.to_vec();
        self.apply_node(&write).await
    }

    async fn set_taint(&self, node: &str, taint: &NodeTaint) -> Result<(), RegistryError> {
        self.apply_node(&NodeWrite::new(node).taint(TaintOp::Set(taint.clone())))
            .await
    }

    async fn remove_taint(&self, node: &str, key: &str) -> Result<(), RegistryError> {
        self.apply_node(&NodeWrite::new(node).taint(TaintOp::Remove(key.to_string())))
            .await
    }

    async fn apply_node(&self, write: &NodeWrite) -> Result<(), RegistryError> {
        self.check_available()?;
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(&write.node)
            .ok_or_else(|| RegistryError::NotFound(write.node.clone()))?;
        apply_to(node, write);
        Ok(())
    }

    /// Validates every target first, then applies all writes under one lock
    async fn apply(&self, batch: &WriteBatch) -> Result<(), RegistryError> {
        self.check_available()?;
        let mut nodes = self.nodes.write().await;
        if let Some(missing) = batch.writes.iter().find(|w| !nodes.contains_key(&w.node)) {
            return Err(RegistryError::NotFound(missing.node.clone()));
        }
        for write in &batch.writes {
            if let Some(node) = nodes.get_mut(&write.node) {
                apply_to(node, write);
            }
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TaintEffect;

    #[tokio::test]
    async fn test_list_with_filter() {
        let registry = MemoryRegistry::with_nodes(vec![
            Node::new("a").with_label("pool", "gpu"),
            Node::new("b"),
        ]);
        let mut filter = BTreeMap::new();
        filter.insert("pool".to_string(), "gpu".to_string());

        let nodes = registry.list_nodes(&filter).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "a");
        assert_eq!(registry.list_nodes(&BTreeMap::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_taint_replaces_same_key() {
        let registry = MemoryRegistry::with_nodes(vec![Node::new("a")]);
        registry
            .set_taint("a", &NodeTaint::new("hc", "suspect", TaintEffect::PreferNoSchedule))
            .await
            .unwrap();
        registry
            .set_taint("a", &NodeTaint::new("hc", "failed", TaintEffect::NoSchedule))
            .await
            .unwrap();

        let node = registry.node("a").await.unwrap();
        assert_eq!(node.taints.len(), 1);
        assert_eq!(node.taints[0].value, "failed");

        registry.remove_taint("a", "hc").await.unwrap();
        registry.remove_taint("a", "hc").await.unwrap();
        assert!(registry.node("a").await.unwrap().taints.is_empty());
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let registry = MemoryRegistry::with_nodes(vec![Node::new("a")]);
        let mut batch = WriteBatch::new();
        batch.push(NodeWrite::new("a").set("k", "v"));
        batch.push(NodeWrite::new("ghost").set("k", "v"));

        let err = registry.apply(&batch).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(name) if name == "ghost"));
        assert!(registry.node("a").await.unwrap().labels.is_empty());
        assert_eq!(registry.batches_applied(), 0);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let registry = MemoryRegistry::with_nodes(vec![Node::new("a")]);
        registry.set_unavailable(true);
        assert!(matches!(
            registry.list_nodes(&BTreeMap::new()).await,
            Err(RegistryError::Unavailable(_))
        ));
        registry.set_unavailable(false);
        assert!(registry.list_nodes(&BTreeMap::new()).await.is_ok());
    }
}
