//! Sidereal topology controller - latency-derived network cost for cluster nodes.
//!
//! The controller is responsible for:
//!
//! - **Node resolution**: Deciding which nodes a `Topology` resource covers
//! - **Latency snapshots**: Reading pairwise average latency from telemetry
//! - **Cost normalisation**: Mapping latency onto an integer scale of 1 to 100
//! - **Label publication**: Writing `network.cost.<peer>` labels onto each node
//! - **Scheduling**: Re-running the pass on resource changes and on an interval
//!
//! # Architecture
//!
//! A pass is resolve, fetch, normalise, publish. The cost range is taken over
//! the whole latency snapshot before any node is written, so every
//! topology shares one scale. Writes are optimistic: a patch pins the
//! node's resource version and is retried against a fresh read on conflict.
//!
//! Placement logic elsewhere in the cluster consumes the labels; this crate
//! never places workloads.
//!
//! # Example
//!
//! ```ignore
//! use sidereal_topology::{TopologyConfig, TopologyService};
//!
//! let config = TopologyConfig::load()?;
//! TopologyService::new(config).run().await?;
//! ```

#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod cost;
pub mod error;
pub mod inventory;
pub mod kubernetes;
pub mod publisher;
pub mod reconcile;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod telemetry;
pub mod types;

// Re-export main types
pub use config::{ApiConfig, ClusterConfig, SourceConfig, SourceKind, TelemetryConfig, TopologyConfig};
pub use cost::{CostRange, MAX_COST, MIN_COST};
pub use error::{Result, TopologyError};
pub use inventory::{InMemoryNodeInventory, LabelPatch, LabelSelector, NodeInventory, NodeRecord};
pub use publisher::{cost_label_key, LabelPublisher, NodeFailure, NodeFailureKind, NodeOutcome, PublishedNode};
pub use reconcile::{PassReport, PassTrigger, Reconciler};
pub use resolver::{NodeSetResolver, Omission, ResolutionRule, ResolvedNodes};
pub use scheduler::ReconciliationScheduler;
pub use service::TopologyService;
pub use telemetry::{
    fetch_snapshot, HttpLatencySource, LatencySnapshot, LatencySource, RawLatencies,
    StaticLatencySource, TelemetryStatus,
};
pub use types::{NodeName, TopologyDeclaration, TopologyKey, TopologySpec};
