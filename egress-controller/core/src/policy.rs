//! The policy document pushed to the firewall backend.
//!
//! Rules reference address groups by their backend id rather than by raw address, so that address
//! churn only updates the groups and leaves the document untouched.

pub use crate::rules::Action;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledPolicy {
    /// The priority of the rule collection group as a whole.
    pub priority: i32,
    pub rule_collections: Vec<RuleCollection>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCollection {
    pub name: String,
    pub action: Action,
    pub priority: i32,
    pub rule_collection_type: RuleCollectionType,
    pub rules: Vec<Rule>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum RuleCollectionType {
    #[serde(rename = "FirewallPolicyFilterRuleCollection")]
    Filter,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "ruleType")]
pub enum Rule {
    #[serde(rename = "NetworkRule")]
    Network(NetworkRule),
    #[serde(rename = "ApplicationRule")]
    Application(ApplicationRule),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRule {
    pub name: String,
    pub source_ip_groups: Vec<String>,
    pub destination_addresses: Vec<String>,
    pub destination_fqdns: Vec<String>,
    pub destination_ports: Vec<String>,
    pub ip_protocols: Vec<NetworkProtocol>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum NetworkProtocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "ICMP")]
    Icmp,
    Any,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRule {
    pub name: String,
    pub source_ip_groups: Vec<String>,
    pub target_fqdns: Vec<String>,
    pub target_urls: Vec<String>,
    #[serde(rename = "terminateTLS")]
    pub terminate_tls: bool,
    pub protocols: Vec<ApplicationProtocol>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationProtocol {
    pub protocol_type: ApplicationProtocolType,
    pub port: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ApplicationProtocolType {
    Http,
    Https,
}

// === impl CompiledPolicy ===

impl CompiledPolicy {
    pub fn collection(&self, name: &str) -> Option<&RuleCollection> {
        self.rule_collections.iter().find(|rc| rc.name == name)
    }

    /// Renders the document as indented JSON for logging.
    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

// === impl Rule ===

impl Rule {
    pub fn name(&self) -> &str {
        match self {
            Self::Network(rule) => &rule.name,
            Self::Application(rule) => &rule.name,
        }
    }

    pub fn source_ip_groups(&self) -> &[String] {
        match self {
            Self::Network(rule) => &rule.source_ip_groups,
            Self::Application(rule) => &rule.source_ip_groups,
        }
    }
}
