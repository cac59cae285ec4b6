//! Kubernetes adapters.
//!
//! [`KubeNodeInventory`] implements [`NodeInventory`](crate::inventory::NodeInventory)
//! over the core `Node` API, and [`TopologyWatcher`] feeds `Topology` custom
//! resources into the scheduler.

mod nodes;
mod topologies;

pub use nodes::KubeNodeInventory;
pub use topologies::{api_resource, parse_topology, TopologyWatcher};

use kube::Client;
use tracing::info;

use crate::error::Result;

/// Connects using the in-cluster service account or the local kubeconfig.
pub async fn connect() -> Result<Client> {
    let client = Client::try_default().await?;
    info!(namespace = client.default_namespace(), "connected to cluster API");
    Ok(client)
}
