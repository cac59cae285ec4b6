//! Error types for the topology controller.

use std::time::Duration;

use thiserror::Error;

/// Topology controller errors.
#[derive(Error, Debug)]
pub enum TopologyError {
    /// Node does not exist in the cluster inventory.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// Node was modified concurrently; the patch was based on a stale version.
    #[error("write conflict on node {node}")]
    Conflict { node: String },

    /// A bounded remote call did not complete in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Telemetry service returned an error or malformed data.
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// Cluster API returned an error.
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Kubernetes client error.
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Desired-state resource is invalid.
    #[error("invalid topology spec: {0}")]
    InvalidSpec(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Work was abandoned because the pass was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl TopologyError {
    /// Create a cluster error.
    #[must_use]
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create a telemetry error.
    #[must_use]
    pub fn telemetry(msg: impl Into<String>) -> Self {
        Self::Telemetry(msg.into())
    }

    /// Returns true if the next scheduled pass may succeed without operator action.
    ///
    /// Recorded on every node failure so a report tells transient trouble
    /// apart from failures that need someone to look.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::Timeout { .. }
                | Self::Telemetry(_)
                | Self::Cluster(_)
                | Self::Kube(_)
                | Self::Http(_)
        )
    }
}

/// Result type for topology operations.
pub type Result<T> = std::result::Result<T, TopologyError>;
