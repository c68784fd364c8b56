use crate::convert;
use egress_controller_core::{
    inventory::{Labels, Node, Pod, PodPhase, ResourceKey, ResourceState},
    resolve::SYSTEM_NAMESPACE,
    rules::{EgressRule, SelectorKind},
};
use egress_controller_k8s_api::{self as k8s, taints, EgressRules, ResourceExt};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the cluster state the controller reconciles against.
///
/// The index is updated by the watch tasks. Each update that may affect the compiled policy, or
/// that requires a node's gate to change, is published as an [`Event`].
#[derive(Debug)]
pub struct Index {
    nodes: BTreeMap<String, NodeState>,
    pods: BTreeMap<(String, String), Pod>,
    rules: BTreeMap<String, Vec<EgressRule>>,
    events: mpsc::UnboundedSender<Event>,
}

/// An action the index requests from the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The resource's change may affect the compiled policy.
    Reconcile(ResourceKey),

    /// The node is not ready and must be gated until its addresses are applied.
    Gate(String),

    /// The node is gated but is not selected by any rule, so nothing has to be applied for it.
    Release(String),
}

#[derive(Clone, Debug)]
struct NodeState {
    node: Node,
    ready: bool,
    gated: bool,
}

// === impl Index ===

impl Index {
    pub fn shared(events: mpsc::UnboundedSender<Event>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            nodes: BTreeMap::new(),
            pods: BTreeMap::new(),
            rules: BTreeMap::new(),
            events,
        }))
    }

    /// Returns all rules, ordered by resource name and then by declaration order.
    pub fn rules(&self) -> Vec<EgressRule> {
        self.rules.values().flatten().cloned().collect()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.values().map(|state| state.node.clone()).collect()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.pods.values().cloned().collect()
    }

    pub fn resource_state(&self, key: &ResourceKey) -> Option<ResourceState> {
        match key {
            ResourceKey::Node(name) => self.nodes.get(name).map(|state| ResourceState {
                labels: state.node.labels.clone(),
                gated: state.gated,
                ready: state.ready,
            }),
            ResourceKey::Pod { namespace, name } => self
                .pods
                .get(&(namespace.clone(), name.clone()))
                .map(|pod| ResourceState {
                    labels: pod.labels.clone(),
                    gated: false,
                    ready: pod.phase == PodPhase::Running,
                }),
            ResourceKey::Rules(name) => self.rules.get(name).map(|_| ResourceState::default()),
        }
    }

    /// Tests whether any rule selects resources of the given kind carrying `labels`.
    fn selects(&self, kind: SelectorKind, labels: &Labels) -> bool {
        self.rules
            .values()
            .flatten()
            .flat_map(|rule| rule.selectors.iter())
            .any(|selector| selector.kind == kind && selector.matches(labels))
    }

    fn publish(&self, event: Event) {
        tracing::debug!(?event, "Publishing");
        if self.events.send(event).is_err() {
            tracing::warn!("Controller is no longer receiving events");
        }
    }
}

impl kubert::index::IndexClusterResource<k8s::Node> for Index {
    fn apply(&mut self, node: k8s::Node) {
        let name = node.name_unchecked();
        let taints = taints::node_taints(&node);
        let state = NodeState {
            ready: !taints::is_not_ready(taints),
            gated: taints::is_gated(taints),
            node: Node {
                name: name.clone(),
                labels: node.labels().clone(),
                addresses: node_addresses(&node),
            },
        };

        if !state.ready {
            if !state.gated {
                self.publish(Event::Gate(name.clone()));
            }
            self.nodes.insert(name, state);
            return;
        }

        let gated = state.gated;
        let selected = self.selects(SelectorKind::Node, &state.node.labels);
        let prev = self.nodes.insert(name.clone(), state.clone());
        let changed = match &prev {
            None => true,
            Some(prev) => {
                !prev.ready
                    || prev.node.labels != state.node.labels
                    || prev.node.primary_address() != state.node.primary_address()
            }
        };
        if !changed && !gated {
            return;
        }

        let was_selected = prev
            .as_ref()
            .map_or(false, |prev| self.selects(SelectorKind::Node, &prev.node.labels));
        if selected || was_selected {
            self.publish(Event::Reconcile(ResourceKey::Node(name)));
        } else if gated {
            self.publish(Event::Release(name));
        }
    }

    fn delete(&mut self, name: String) {
        if let Some(prev) = self.nodes.remove(&name) {
            if self.selects(SelectorKind::Node, &prev.node.labels) {
                self.publish(Event::Reconcile(ResourceKey::Node(name)));
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        if namespace == SYSTEM_NAMESPACE {
            return;
        }
        let name = pod.name_unchecked();
        let status = pod.status.as_ref();
        let pod = Pod {
            namespace: namespace.clone(),
            name: name.clone(),
            phase: status
                .and_then(|status| status.phase.as_deref())
                .map_or(PodPhase::Unknown, PodPhase::from),
            host_address: status
                .and_then(|status| status.host_ip.clone())
                .filter(|ip| !ip.is_empty()),
            labels: pod.labels().clone(),
        };

        let selected = self.selects(SelectorKind::Pod, &pod.labels);
        let prev = self.pods.insert((namespace.clone(), name.clone()), pod.clone());
        if prev.as_ref() == Some(&pod) {
            return;
        }
        let was_selected = prev
            .as_ref()
            .map_or(false, |prev| self.selects(SelectorKind::Pod, &prev.labels));
        if selected || was_selected {
            self.publish(Event::Reconcile(ResourceKey::Pod { namespace, name }));
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(prev) = self.pods.remove(&(namespace.clone(), name.clone())) {
            if self.selects(SelectorKind::Pod, &prev.labels) {
                self.publish(Event::Reconcile(ResourceKey::Pod { namespace, name }));
            }
        }
    }
}

impl kubert::index::IndexClusterResource<EgressRules> for Index {
    fn apply(&mut self, resource: EgressRules) {
        let name = resource.name_unchecked();
        let rules = convert::egress_rules(&resource);
        tracing::debug!(%name, rules = rules.len(), "Indexing egress rules");
        self.rules.insert(name.clone(), rules);
        self.publish(Event::Reconcile(ResourceKey::Rules(name)));
    }

    fn delete(&mut self, name: String) {
        self.rules.remove(&name);
        self.publish(Event::Reconcile(ResourceKey::Rules(name)));
    }
}

/// Returns the node's addresses with internal IPs first, otherwise in status order.
fn node_addresses(node: &k8s::Node) -> Vec<String> {
    let addrs = node
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_deref())
        .unwrap_or_default();
    let (mut internal, other): (Vec<_>, Vec<_>) =
        addrs.iter().partition(|addr| addr.type_ == "InternalIP");
    internal.extend(other);
    internal.into_iter().map(|addr| addr.address.clone()).collect()
}
