//! The node taint that holds workloads off a node until its addresses are in the firewall policy.

use k8s_openapi::api::core::v1::{Node, Taint};

pub const GATE_KEY: &str = "egress-firewall-policy";
pub const GATE_VALUE: &str = "update-pending";
pub const NO_SCHEDULE: &str = "NoSchedule";

/// Taints set on nodes that are still joining the cluster.
const NOT_READY_KEYS: [&str; 2] = [
    "node.kubernetes.io/not-ready",
    "node.cloudprovider.kubernetes.io/uninitialized",
];

pub fn gate() -> Taint {
    Taint {
        key: GATE_KEY.to_string(),
        value: Some(GATE_VALUE.to_string()),
        effect: NO_SCHEDULE.to_string(),
        time_added: None,
    }
}

pub fn node_taints(node: &Node) -> &[Taint] {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_deref())
        .unwrap_or_default()
}

pub fn is_gated(taints: &[Taint]) -> bool {
    taints
        .iter()
        .any(|t| t.key == GATE_KEY && t.effect == NO_SCHEDULE)
}

pub fn is_not_ready(taints: &[Taint]) -> bool {
    taints
        .iter()
        .any(|t| NOT_READY_KEYS.contains(&t.key.as_str()) && t.effect == NO_SCHEDULE)
}

/// Returns the node's taints with the gate added or removed, or `None` if they already match.
pub fn with_gate(taints: &[Taint], present: bool) -> Option<Vec<Taint>> {
    if is_gated(taints) == present {
        return None;
    }
    if present {
        let mut taints = taints.to_vec();
        taints.push(gate());
        Some(taints)
    } else {
        Some(
            taints
                .iter()
                .filter(|t| t.key != GATE_KEY)
                .cloned()
                .collect(),
        )
    }
}
