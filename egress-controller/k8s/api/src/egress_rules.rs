use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declares egress firewall rules for the nodes and pods matched by label selectors.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "egress.firewall-controller.io",
    version = "v1",
    kind = "EgressRules",
    plural = "egressrules"
)]
#[serde(rename_all = "camelCase")]
pub struct EgressRulesSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress_rules: Vec<EgressRuleSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressRuleSpec {
    pub name: String,

    /// Each `key: value` pair selects the nodes carrying that label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<Vec<BTreeMap<String, String>>>,

    /// Each `key: value` pair selects the running pods carrying that label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<Vec<BTreeMap<String, String>>>,

    pub rules: Vec<FirewallRuleSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRuleSpec {
    pub rule_collection_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    pub rule_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_addresses: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_ports: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_fqdns: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_fqdns: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_urls: Option<Vec<String>>,

    /// Network rules take `TCP`, `UDP`, `ICMP` or `Any`; application rules take `SCHEME:PORT`.
    #[serde(default)]
    pub protocol: Vec<String>,

    pub action: FirewallAction,
    pub rule_type: RuleType,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum FirewallAction {
    Allow,
    Deny,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum RuleType {
    Application,
    Network,
}

impl From<FirewallAction> for egress_controller_core::rules::Action {
    fn from(action: FirewallAction) -> Self {
        match action {
            FirewallAction::Allow => Self::Allow,
            FirewallAction::Deny => Self::Deny,
        }
    }
}
