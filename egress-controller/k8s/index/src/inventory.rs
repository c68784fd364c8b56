use crate::SharedIndex;
use anyhow::{Context, Result};
use egress_controller_core::{
    inventory::{Inventory, Node, Pod, ResourceKey, ResourceState},
    rules::EgressRule,
};
use egress_controller_k8s_api::{self as k8s, taints, Api, Patch, PatchParams, ResourceExt};

/// Reads the inventory from the index and writes gates to the API server.
#[derive(Clone)]
pub struct KubeInventory {
    index: SharedIndex,
    client: k8s::Client,
}

impl KubeInventory {
    pub fn new(index: SharedIndex, client: k8s::Client) -> Self {
        Self { index, client }
    }
}

#[async_trait::async_trait]
impl Inventory for KubeInventory {
    async fn list_rules(&self) -> Result<Vec<EgressRule>> {
        Ok(self.index.read().rules())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.index.read().nodes())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.index.read().pods())
    }

    async fn get_resource(&self, key: &ResourceKey) -> Result<Option<ResourceState>> {
        Ok(self.index.read().resource_state(key))
    }

    async fn set_gate(&self, key: &ResourceKey, present: bool) -> Result<()> {
        match key {
            ResourceKey::Node(name) => set_node_gate(&self.client, name, present).await,
            // Only nodes are gated.
            ResourceKey::Pod { .. } | ResourceKey::Rules(_) => Ok(()),
        }
    }
}

/// Adds or removes the gate taint on a node.
///
/// The patch carries the node's resource version so that a concurrent change to its taints fails
/// the patch instead of being overwritten.
pub(crate) async fn set_node_gate(client: &k8s::Client, name: &str, present: bool) -> Result<()> {
    let api = Api::<k8s::Node>::all(client.clone());
    let node = match api.get_opt(name).await.context("failed to get node")? {
        Some(node) => node,
        None => {
            tracing::debug!(%name, "Node no longer exists");
            return Ok(());
        }
    };

    let taints = match taints::with_gate(taints::node_taints(&node), present) {
        Some(taints) => taints,
        None => return Ok(()),
    };
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": node.resource_version() },
        "spec": { "taints": taints },
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
        .await
        .context("failed to patch node taints")?;

    if present {
        tracing::info!(%name, "Gated node");
    } else {
        tracing::info!(%name, "Released node gate");
    }
    Ok(())
}
