//! Resolution of the node population in scope for a pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::inventory::{bounded, LabelSelector, NodeInventory, NodeRecord};
use crate::types::TopologySpec;

/// Which rule of the resolution priority produced the node set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    /// Explicit `nodeNames`.
    Names,
    /// `nodeSelector` match.
    Selector,
    /// Every node in the cluster.
    All,
}

/// A named node that could not be brought into scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Omission {
    /// The name as listed in `nodeNames`.
    pub name: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Nodes in scope for a pass.
#[derive(Debug, Clone)]
pub struct ResolvedNodes {
    /// Rule that selected the nodes.
    pub rule: ResolutionRule,
    /// Nodes in scope, without duplicates.
    pub nodes: Vec<NodeRecord>,
    /// Named nodes that were skipped.
    pub omitted: Vec<Omission>,
}

impl ResolvedNodes {
    /// Names of the nodes in scope.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }
}

/// Determines which nodes a topology covers.
///
/// Priority, first match wins:
/// 1. non-empty `nodeNames`: each name is looked up; unknown names are
///    omitted and reported, never fatal
/// 2. non-empty `nodeSelector`: nodes matching every pair
/// 3. every node in the cluster
pub struct NodeSetResolver {
    inventory: Arc<dyn NodeInventory>,
    request_timeout: Duration,
}

impl NodeSetResolver {
    /// Creates a resolver reading from `inventory`.
    pub fn new(inventory: Arc<dyn NodeInventory>, request_timeout: Duration) -> Self {
        Self {
            inventory,
            request_timeout,
        }
    }

    /// Resolves the node set for `spec`.
    ///
    /// Fails only when the inventory cannot be listed; lookups of individual
    /// names never fail the resolution.
    pub async fn resolve(&self, spec: &TopologySpec) -> Result<ResolvedNodes> {
        if let Some(names) = spec.node_names.as_ref().filter(|n| !n.is_empty()) {
            return Ok(self.resolve_names(names).await);
        }

        if let Some(pairs) = spec.node_selector.as_ref().filter(|s| !s.is_empty()) {
            let selector = LabelSelector::new(pairs.clone());
            let nodes = self.list(Some(&selector)).await?;
            debug!(selector = %selector, count = nodes.len(), "nodes selected by label");
            return Ok(ResolvedNodes {
                rule: ResolutionRule::Selector,
                nodes,
                omitted: Vec::new(),
            });
        }

        let nodes = self.list(None).await?;
        debug!(count = nodes.len(), "all nodes selected");
        Ok(ResolvedNodes {
            rule: ResolutionRule::All,
            nodes,
            omitted: Vec::new(),
        })
    }

    async fn resolve_names(&self, names: &[String]) -> ResolvedNodes {
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        let mut omitted = Vec::new();

        for name in names {
            if !seen.insert(name.as_str()) {
                continue;
            }

            let lookup = bounded(
                self.request_timeout,
                "node read",
                self.inventory.get_node(name),
            )
            .await;

            match lookup {
                Ok(Some(node)) => nodes.push(node),
                Ok(None) => {
                    warn!(node = %name, "named node does not exist, skipping");
                    omitted.push(Omission {
                        name: name.clone(),
                        reason: "not found".to_owned(),
                    });
                }
                Err(e) => {
                    warn!(node = %name, error = %e, "failed to read named node, skipping");
                    omitted.push(Omission {
                        name: name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        ResolvedNodes {
            rule: ResolutionRule::Names,
            nodes,
            omitted,
        }
    }

    async fn list(&self, selector: Option<&LabelSelector>) -> Result<Vec<NodeRecord>> {
        let mut nodes = bounded(
            self.request_timeout,
            "node list",
            self.inventory.list_nodes(selector),
        )
        .await?;

        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes.dedup_by(|a, b| a.name == b.name);
        Ok(nodes)
    }
}

impl std::fmt::Debug for NodeSetResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSetResolver")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
