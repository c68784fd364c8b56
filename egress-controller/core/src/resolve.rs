//! Resolves selectors against an inventory snapshot.

use crate::{
    inventory::{Node, Pod, PodPhase},
    rules::{Selector, SelectorKind},
};
use ahash::AHashSet as HashSet;

/// Pods in this namespace never contribute addresses.
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// The nodes and pods read at the start of a reconciliation pass.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub nodes: Vec<Node>,
    pub pods: Vec<Pod>,
}

impl Snapshot {
    pub fn resolve(&self, selector: &Selector) -> Vec<String> {
        match selector.kind {
            SelectorKind::Node => node_addresses(selector, &self.nodes),
            SelectorKind::Pod => pod_addresses(selector, &self.pods),
        }
    }
}

/// Returns the distinct primary addresses of the nodes matched by `selector`, in node order.
pub fn node_addresses(selector: &Selector, nodes: &[Node]) -> Vec<String> {
    distinct(
        nodes
            .iter()
            .filter(|node| selector.matches(&node.labels))
            .filter_map(Node::primary_address),
    )
}

/// Returns the distinct host addresses of the running pods matched by `selector`, in pod order.
pub fn pod_addresses(selector: &Selector, pods: &[Pod]) -> Vec<String> {
    distinct(
        pods.iter()
            .filter(|pod| pod.namespace != SYSTEM_NAMESPACE && pod.phase == PodPhase::Running)
            .filter(|pod| selector.matches(&pod.labels))
            .filter_map(|pod| pod.host_address.as_deref()),
    )
}

fn distinct<'a>(addrs: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    addrs
        .filter(|addr| seen.insert(*addr))
        .map(ToString::to_string)
        .collect()
}
