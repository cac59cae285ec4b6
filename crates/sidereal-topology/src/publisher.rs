//! Publication of network costs as node labels.
//!
//! Each node in scope receives one patch per pass holding a
//! `network.cost.<peer>` label for every peer it has a latency sample for,
//! plus `network.cost.<self> = 1`. Labels are only ever added or
//! overwritten; peers that drop out of telemetry keep their last value.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::cost::{CostRange, MIN_COST};
use crate::error::TopologyError;
use crate::inventory::{bounded, LabelPatch, NodeInventory, NodeRecord};
use crate::telemetry::LatencySnapshot;
use crate::types::NodeName;

/// Prefix shared by every label this controller owns.
pub const COST_LABEL_PREFIX: &str = "network.cost.";

/// Label key carrying the cost towards `peer`.
#[must_use]
pub fn cost_label_key(peer: &str) -> String {
    format!("{COST_LABEL_PREFIX}{peer}")
}

/// Why a node could not be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeFailureKind {
    /// Every attempt lost a race with a concurrent writer.
    ConflictExhausted,
    /// A read or write did not complete in time.
    Timeout,
    /// The cluster API rejected the request.
    Cluster,
    /// The node disappeared during the pass.
    NotFound,
    /// The pass was cancelled before the write was confirmed. A request
    /// already on the wire may still have been applied by the API server.
    Cancelled,
}

impl From<&TopologyError> for NodeFailureKind {
    fn from(error: &TopologyError) -> Self {
        match error {
            TopologyError::Conflict { .. } => Self::ConflictExhausted,
            TopologyError::Timeout { .. } => Self::Timeout,
            TopologyError::NodeNotFound(_) => Self::NotFound,
            TopologyError::Cancelled => Self::Cancelled,
            _ => Self::Cluster,
        }
    }
}

/// A node whose labels are up to date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedNode {
    /// Node name.
    pub node: NodeName,
    /// Cost labels now carried by the node.
    pub labels: BTreeMap<String, String>,
    /// Write attempts made, zero when nothing had to change.
    pub attempts: u32,
    /// True if the node already carried these labels.
    pub unchanged: bool,
}

/// A node that could not be published this pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    /// Node name.
    pub node: NodeName,
    /// Failure class.
    pub kind: NodeFailureKind,
    /// Last error seen.
    pub reason: String,
    /// Write attempts made.
    pub attempts: u32,
    /// True if the next scheduled pass is expected to succeed on its own.
    pub retryable: bool,
}

/// Result of publishing one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Labels are in place.
    Published(PublishedNode),
    /// The node was skipped or every attempt failed.
    Failed(NodeFailure),
}

impl NodeOutcome {
    /// Node the outcome refers to.
    #[must_use]
    pub fn node(&self) -> &str {
        match self {
            Self::Published(p) => &p.node,
            Self::Failed(f) => &f.node,
        }
    }

    fn failed(node: &str, error: &TopologyError, attempts: u32) -> Self {
        Self::Failed(NodeFailure {
            node: node.to_owned(),
            kind: error.into(),
            reason: error.to_string(),
            attempts,
            retryable: error.is_retryable(),
        })
    }
}

/// Writes cost labels to nodes.
pub struct LabelPublisher {
    inventory: Arc<dyn NodeInventory>,
    request_timeout: Duration,
    max_conflict_retries: u32,
    concurrency: usize,
}

impl LabelPublisher {
    /// Creates a publisher writing through `inventory`.
    pub fn new(inventory: Arc<dyn NodeInventory>, config: &ClusterConfig) -> Self {
        Self {
            inventory,
            request_timeout: config.request_timeout,
            max_conflict_retries: config.max_conflict_retries,
            concurrency: config.publish_concurrency.max(1),
        }
    }

    /// Computes the labels `node` should carry for this snapshot.
    ///
    /// The self label is set last so a self sample in the snapshot can never
    /// override it.
    #[must_use]
    pub fn build_patch(node: &str, snapshot: &LatencySnapshot, range: CostRange) -> LabelPatch {
        let mut patch = LabelPatch::new(node);

        if let Some(peers) = snapshot.peers_of(node) {
            for (peer, latency) in peers {
                let cost = range.normalize(*latency);
                debug!(node = %node, peer = %peer, latency, cost, "computed network cost");
                patch.set(cost_label_key(peer), cost.to_string());
            }
        }

        patch.set(cost_label_key(node), MIN_COST.to_string());
        patch
    }

    /// Publishes one node's labels.
    ///
    /// The first attempt is made against `node` as it was resolved. A conflict
    /// triggers a fresh read and another attempt, up to
    /// `max_conflict_retries` times. Other failures are not retried within
    /// the pass.
    pub async fn publish_node(
        &self,
        node: &NodeRecord,
        snapshot: &LatencySnapshot,
        range: CostRange,
    ) -> NodeOutcome {
        let patch = Self::build_patch(&node.name, snapshot, range);
        let mut current = node.clone();
        let mut attempts = 0;

        loop {
            if patch.is_noop_for(&current.labels) {
                debug!(node = %node.name, "cost labels already current");
                return NodeOutcome::Published(PublishedNode {
                    node: node.name.clone(),
                    labels: patch.labels,
                    attempts,
                    unchanged: attempts == 0,
                });
            }

            attempts += 1;
            let pinned = patch.clone().against(current.resource_version.clone());
            let written = bounded(
                self.request_timeout,
                "node patch",
                self.inventory.patch_labels(&pinned),
            )
            .await;

            match written {
                Ok(()) => {
                    debug!(node = %node.name, attempts, labels = patch.labels.len(), "cost labels written");
                    return NodeOutcome::Published(PublishedNode {
                        node: node.name.clone(),
                        labels: patch.labels,
                        attempts,
                        unchanged: false,
                    });
                }
                Err(TopologyError::Conflict { .. }) if attempts <= self.max_conflict_retries => {
                    debug!(node = %node.name, attempts, "write conflict, re-reading node");
                    current = match self.reread(&node.name).await {
                        Ok(fresh) => fresh,
                        Err(e) => {
                            warn!(node = %node.name, error = %e, "failed to re-read node after conflict");
                            return NodeOutcome::failed(&node.name, &e, attempts);
                        }
                    };
                }
                Err(e) => {
                    warn!(node = %node.name, attempts, error = %e, "failed to publish cost labels");
                    return NodeOutcome::failed(&node.name, &e, attempts);
                }
            }
        }
    }

    async fn reread(&self, name: &str) -> Result<NodeRecord, TopologyError> {
        bounded(self.request_timeout, "node read", self.inventory.get_node(name))
            .await?
            .ok_or_else(|| TopologyError::NodeNotFound(name.to_owned()))
    }

    /// Publishes every node, at most `publish_concurrency` at a time.
    ///
    /// Cancelling `cancel` drops in-flight writes and marks every node whose
    /// write was not confirmed as [`NodeFailureKind::Cancelled`]. A node's
    /// patch is a single request, so a node ends up either fully written or
    /// untouched, but a dropped request may already have reached the API
    /// server: `Cancelled` means unconfirmed, not unwritten. The next pass
    /// finds such a node current and skips it.
    /// Outcomes are returned sorted by node name.
    pub async fn publish_all(
        &self,
        nodes: &[NodeRecord],
        snapshot: &LatencySnapshot,
        range: CostRange,
        cancel: &CancellationToken,
    ) -> Vec<NodeOutcome> {
        let publishes: Vec<_> = nodes
            .iter()
            .map(|node| async move {
                if cancel.is_cancelled() {
                    return NodeOutcome::failed(&node.name, &TopologyError::Cancelled, 0);
                }
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        info!(node = %node.name, "publish cancelled");
                        NodeOutcome::failed(&node.name, &TopologyError::Cancelled, 0)
                    }
                    outcome = self.publish_node(node, snapshot, range) => outcome,
                }
            })
            .collect();
        let mut outcomes: Vec<NodeOutcome> = stream::iter(publishes)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        outcomes.sort_by(|a, b| a.node().cmp(b.node()));
        outcomes
    }
}

impl std::fmt::Debug for LabelPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelPublisher")
            .field("request_timeout", &self.request_timeout)
            .field("max_conflict_retries", &self.max_conflict_retries)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}
