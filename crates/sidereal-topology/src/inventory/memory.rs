//! In-memory node inventory for testing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{Result, TopologyError};
use crate::types::NodeName;

use super::{LabelPatch, LabelSelector, NodeInventory, NodeRecord};

/// In-memory node inventory.
///
/// Every accepted write bumps a global resource version, mirroring how the
/// cluster state store versions objects. Conflicts, transient failures and
/// slow writes can be injected per node.
#[derive(Debug)]
pub struct InMemoryNodeInventory {
    nodes: DashMap<NodeName, NodeRecord>,
    version: AtomicU64,
    pending_conflicts: DashMap<NodeName, u32>,
    pending_failures: DashMap<NodeName, u32>,
    patch_delay: Mutex<Option<Duration>>,
    list_unavailable: AtomicBool,
    patch_attempts: DashMap<NodeName, u32>,
}

impl InMemoryNodeInventory {
    /// Creates an empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            version: AtomicU64::new(0),
            pending_conflicts: DashMap::new(),
            pending_failures: DashMap::new(),
            patch_delay: Mutex::new(None),
            list_unavailable: AtomicBool::new(false),
            patch_attempts: DashMap::new(),
        }
    }

    /// Creates an inventory holding the given nodes.
    #[must_use]
    pub fn with_nodes(nodes: impl IntoIterator<Item = NodeRecord>) -> Self {
        let inventory = Self::new();
        for node in nodes {
            inventory.insert(node);
        }
        inventory
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Inserts or replaces a node, assigning it a fresh version.
    pub fn insert(&self, mut node: NodeRecord) {
        node.resource_version = Some(self.next_version());
        self.nodes.insert(node.name.clone(), node);
    }

    /// Returns the current labels of a node.
    #[must_use]
    pub fn labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.nodes.get(name).map(|n| n.labels.clone())
    }

    /// Returns the current state of a node.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<NodeRecord> {
        self.nodes.get(name).map(|n| n.clone())
    }

    /// Sets a label as another actor would, bumping the node version.
    pub fn set_label(&self, name: &str, key: impl Into<String>, value: impl Into<String>) {
        let version = self.next_version();
        if let Some(mut node) = self.nodes.get_mut(name) {
            node.labels.insert(key.into(), value.into());
            node.resource_version = Some(version);
        }
    }

    /// Makes the next `count` patches of `name` lose a race with a concurrent writer.
    pub fn inject_conflicts(&self, name: &str, count: u32) {
        self.pending_conflicts.insert(name.to_owned(), count);
    }

    /// Makes the next `count` patches of `name` fail with a transient cluster error.
    pub fn inject_failures(&self, name: &str, count: u32) {
        self.pending_failures.insert(name.to_owned(), count);
    }

    /// Delays every patch by `delay`.
    pub fn set_patch_delay(&self, delay: Option<Duration>) {
        *self.patch_delay.lock() = delay;
    }

    /// Makes node listing fail as if the API server were unreachable.
    pub fn set_list_unavailable(&self, unavailable: bool) {
        self.list_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns how many patches were attempted against a node.
    #[must_use]
    pub fn patch_attempts(&self, name: &str) -> u32 {
        self.patch_attempts.get(name).map_or(0, |n| *n)
    }

    fn take_injected(map: &DashMap<NodeName, u32>, name: &str) -> bool {
        match map.get_mut(name) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn sorted(mut nodes: Vec<NodeRecord>) -> Vec<NodeRecord> {
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }
}

impl Default for InMemoryNodeInventory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeInventory for InMemoryNodeInventory {
    async fn list_nodes(&self, selector: Option<&LabelSelector>) -> Result<Vec<NodeRecord>> {
        if self.list_unavailable.load(Ordering::SeqCst) {
            return Err(TopologyError::cluster("node list unavailable"));
        }

        let nodes = self
            .nodes
            .iter()
            .filter(|n| selector.map_or(true, |s| s.matches(&n.labels)))
            .map(|n| n.value().clone())
            .collect();

        Ok(Self::sorted(nodes))
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeRecord>> {
        Ok(self.node(name))
    }

    async fn patch_labels(&self, patch: &LabelPatch) -> Result<()> {
        *self.patch_attempts.entry(patch.node.clone()).or_insert(0) += 1;

        let delay = *self.patch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if Self::take_injected(&self.pending_failures, &patch.node) {
            return Err(TopologyError::cluster(format!(
                "transient failure writing {}",
                patch.node
            )));
        }

        if Self::take_injected(&self.pending_conflicts, &patch.node) {
            // Someone else wrote the node first.
            let version = self.next_version();
            if let Some(mut node) = self.nodes.get_mut(&patch.node) {
                node.resource_version = Some(version);
            }
            return Err(TopologyError::Conflict {
                node: patch.node.clone(),
            });
        }

        let version = self.next_version();
        let mut node = self
            .nodes
            .get_mut(&patch.node)
            .ok_or_else(|| TopologyError::NodeNotFound(patch.node.clone()))?;

        if patch.expected_version.is_some() && patch.expected_version != node.resource_version {
            return Err(TopologyError::Conflict {
                node: patch.node.clone(),
            });
        }

        node.labels = patch.apply_to(&node.labels);
        node.resource_version = Some(version);
        Ok(())
    }
}
