use crate::rules::EgressRule;
use anyhow::Result;
use std::{collections::BTreeMap, fmt};

pub type Labels = BTreeMap<String, String>;

/// Identifies the resource whose change triggered a reconciliation.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceKey {
    Node(String),
    Pod { namespace: String, name: String },
    Rules(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub labels: Labels,

    /// Node addresses, primary address first.
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    pub phase: PodPhase,
    pub host_address: Option<String>,
    pub labels: Labels,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// The gate-relevant state of a single resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceState {
    pub labels: Labels,

    /// Whether the resource carries the pending-update gate.
    pub gated: bool,

    /// Whether the resource is ready for its gate to be released.
    pub ready: bool,
}

/// Reads the rule set and the cluster inventory, and mutates the pending-update gate.
///
/// Lists are returned in a stable order so that the same inventory always resolves to the same
/// address lists.
#[async_trait::async_trait]
pub trait Inventory: Send + Sync + 'static {
    async fn list_rules(&self) -> Result<Vec<EgressRule>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn list_pods(&self) -> Result<Vec<Pod>>;

    async fn get_resource(&self, key: &ResourceKey) -> Result<Option<ResourceState>>;

    async fn set_gate(&self, key: &ResourceKey, present: bool) -> Result<()>;
}

// === impl ResourceKey ===

impl ResourceKey {
    pub fn node(name: impl Into<String>) -> Self {
        Self::Node(name.into())
    }

    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Pod {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn rules(name: impl Into<String>) -> Self {
        Self::Rules(name.into())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(name) => write!(f, "node/{}", name),
            Self::Pod { namespace, name } => write!(f, "pod/{}/{}", namespace, name),
            Self::Rules(name) => write!(f, "egressrules/{}", name),
        }
    }
}

// === impl Node ===

impl Node {
    #[inline]
    pub fn primary_address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }
}

// === impl PodPhase ===

impl From<&str> for PodPhase {
    fn from(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}
