//! Node inventory backed by the cluster API.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::{json, Value};

use crate::error::{Result, TopologyError};
use crate::inventory::{LabelPatch, LabelSelector, NodeInventory, NodeRecord};

/// Reads and labels cluster nodes through the Kubernetes API.
#[derive(Clone)]
pub struct KubeNodeInventory {
    api: Api<Node>,
}

impl KubeNodeInventory {
    /// Creates an inventory over every node visible to `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

fn record(node: Node) -> NodeRecord {
    NodeRecord {
        name: node.metadata.name.unwrap_or_default(),
        labels: node.metadata.labels.unwrap_or_default(),
        resource_version: node.metadata.resource_version,
    }
}

/// JSON merge patch setting the patch's labels.
///
/// Carrying `metadata.resourceVersion` makes the API server reject the write
/// with 409 if the node changed since it was read.
fn merge_patch_body(patch: &LabelPatch) -> Value {
    let mut metadata = json!({ "labels": patch.labels });
    if let Some(version) = &patch.expected_version {
        metadata["resourceVersion"] = json!(version);
    }
    json!({ "metadata": metadata })
}

#[async_trait]
impl NodeInventory for KubeNodeInventory {
    async fn list_nodes(&self, selector: Option<&LabelSelector>) -> Result<Vec<NodeRecord>> {
        let mut params = ListParams::default();
        if let Some(selector) = selector.filter(|s| !s.is_empty()) {
            params = params.labels(&selector.to_query());
        }

        let nodes = self.api.list(&params).await?;
        Ok(nodes.items.into_iter().map(record).collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeRecord>> {
        Ok(self.api.get_opt(name).await?.map(record))
    }

    async fn patch_labels(&self, patch: &LabelPatch) -> Result<()> {
        let body = merge_patch_body(patch);
        match self
            .api
            .patch(&patch.node, &PatchParams::default(), &Patch::Merge(&body))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(TopologyError::Conflict {
                    node: patch.node.clone(),
                })
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(TopologyError::NodeNotFound(patch.node.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
