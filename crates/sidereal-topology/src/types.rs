//! Core types for the topology controller.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TopologyError};

/// Cluster node identifier.
pub type NodeName = String;

/// Desired topology declared by a `Topology` resource.
///
/// Scope resolution follows a strict priority: explicit `nodeNames`, then
/// `nodeSelector`, then every node in the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpec {
    /// Explicit node names, in declaration order.
    #[serde(default, alias = "nodes", skip_serializing_if = "Option::is_none")]
    pub node_names: Option<Vec<String>>,

    /// Label selector; a node must match every pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Delay between the end of one pass and the start of the next.
    #[serde(alias = "runInterval")]
    pub run_interval_seconds: u64,
}

impl TopologySpec {
    /// Spec covering every node in the cluster.
    #[must_use]
    pub const fn all_nodes(run_interval_seconds: u64) -> Self {
        Self {
            node_names: None,
            node_selector: None,
            run_interval_seconds,
        }
    }

    /// Spec naming explicit nodes.
    #[must_use]
    pub fn with_names<I, S>(names: I, run_interval_seconds: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            node_names: Some(names.into_iter().map(Into::into).collect()),
            node_selector: None,
            run_interval_seconds,
        }
    }

    /// Spec selecting nodes by label.
    #[must_use]
    pub fn with_selector<I, K, V>(pairs: I, run_interval_seconds: u64) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            node_names: None,
            node_selector: Some(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            run_interval_seconds,
        }
    }

    /// Checks the invariants the controller relies on.
    pub fn validate(&self) -> Result<()> {
        if self.run_interval_seconds == 0 {
            return Err(TopologyError::InvalidSpec(
                "runIntervalSeconds must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Returns the requeue delay.
    #[must_use]
    pub const fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_seconds)
    }
}

/// Identity of a desired-state resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopologyKey {
    /// Namespace, if the resource is namespaced.
    pub namespace: Option<String>,
    /// Resource name.
    pub name: String,
}

impl TopologyKey {
    /// Create a key for a cluster-scoped resource.
    #[must_use]
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Create a key for a namespaced resource.
    #[must_use]
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for TopologyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A statically declared topology.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopologyDeclaration {
    /// Namespace of the declaration.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Name of the declaration.
    pub name: String,
    /// The desired topology.
    pub spec: TopologySpec,
}

impl TopologyDeclaration {
    /// Returns the resource key.
    #[must_use]
    pub fn key(&self) -> TopologyKey {
        TopologyKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}
