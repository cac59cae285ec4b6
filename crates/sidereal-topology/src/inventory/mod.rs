//! Cluster node inventory.
//!
//! The controller reads nodes and writes their labels through the
//! [`NodeInventory`] trait. The production implementation talks to the
//! Kubernetes API (see [`crate::kubernetes`]); an in-memory implementation is
//! provided for tests and dry runs.

mod memory;

pub use memory::InMemoryNodeInventory;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, TopologyError};
use crate::types::NodeName;

/// A node as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Node name.
    pub name: NodeName,
    /// Current labels.
    pub labels: BTreeMap<String, String>,
    /// Version used for optimistic concurrency.
    pub resource_version: Option<String>,
}

impl NodeRecord {
    /// Create a record with no labels.
    #[must_use]
    pub fn new(name: impl Into<NodeName>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            resource_version: None,
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Equality-based label selector; every pair must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Create a selector from key/value pairs.
    #[must_use]
    pub const fn new(match_labels: BTreeMap<String, String>) -> Self {
        Self { match_labels }
    }

    /// Returns true if the selector places no constraint.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    /// Returns true if `labels` contains every pair of the selector.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }

    /// Renders the selector in `k1=v1,k2=v2` query form.
    #[must_use]
    pub fn to_query(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}

/// Labels to add or overwrite on a single node.
///
/// A patch never removes keys. When `expected_version` is set the write is
/// rejected with [`TopologyError::Conflict`](crate::TopologyError::Conflict)
/// if the node changed since it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPatch {
    /// Target node.
    pub node: NodeName,
    /// Version the patch was computed against.
    pub expected_version: Option<String>,
    /// Labels to set.
    pub labels: BTreeMap<String, String>,
}

impl LabelPatch {
    /// Create an empty patch for a node.
    #[must_use]
    pub fn new(node: impl Into<NodeName>) -> Self {
        Self {
            node: node.into(),
            expected_version: None,
            labels: BTreeMap::new(),
        }
    }

    /// Sets a label, replacing any earlier value for the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(key.into(), value.into());
    }

    /// Pins the patch to a resource version.
    #[must_use]
    pub fn against(mut self, version: Option<String>) -> Self {
        self.expected_version = version;
        self
    }

    /// Returns `labels` with the patch applied.
    #[must_use]
    pub fn apply_to(&self, labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = labels.clone();
        merged.extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Returns true if applying the patch would change nothing.
    #[must_use]
    pub fn is_noop_for(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|current| current == v))
    }
}

/// Backend for reading nodes and writing their labels.
#[async_trait]
pub trait NodeInventory: Send + Sync {
    /// Lists nodes, optionally restricted by a label selector.
    async fn list_nodes(&self, selector: Option<&LabelSelector>) -> Result<Vec<NodeRecord>>;

    /// Gets a node by name.
    ///
    /// Returns `None` if the node does not exist.
    async fn get_node(&self, name: &str) -> Result<Option<NodeRecord>>;

    /// Applies a label patch to a node as a single atomic write.
    async fn patch_labels(&self, patch: &LabelPatch) -> Result<()>;
}

/// Runs an inventory call, failing with [`TopologyError::Timeout`] after `timeout`.
pub async fn bounded<T, F>(timeout: Duration, operation: &'static str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(TopologyError::Timeout {
            operation,
            after: timeout,
        }))
}
