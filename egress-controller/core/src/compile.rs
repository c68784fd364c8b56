//! Compiles egress rules into rule collections.

use crate::{
    policy::{
        ApplicationProtocol, ApplicationProtocolType, ApplicationRule, CompiledPolicy,
        NetworkProtocol, NetworkRule, Rule, RuleCollection, RuleCollectionType,
    },
    rules::{Destination, EgressRule, RuleKind, RuleSpec},
};
use ahash::AHashMap as HashMap;
use tracing::warn;

/// Maps an egress rule's name to the backend ids of its address groups.
pub type SourceGroups = HashMap<String, Vec<String>>;

pub fn compile_policy(
    priority: i32,
    rules: &[EgressRule],
    sources: &SourceGroups,
) -> CompiledPolicy {
    CompiledPolicy {
        priority,
        rule_collections: compile(rules, sources),
    }
}

/// Builds one collection per distinct collection name, in first-encounter order.
///
/// Rules without address groups are skipped: a rule with no sources cannot be expressed. A
/// collection takes its action and priority from the first rule spec that names it; later specs
/// only contribute rules.
pub fn compile(rules: &[EgressRule], sources: &SourceGroups) -> Vec<RuleCollection> {
    let mut collections = Vec::<RuleCollection>::new();
    let mut by_name = HashMap::<String, usize>::new();

    for rule in rules {
        let groups = match sources.get(&rule.name) {
            Some(groups) if !groups.is_empty() => groups,
            _ => continue,
        };

        for spec in &rule.rules {
            let compiled = compile_rule(spec, groups);
            match by_name.get(&spec.collection) {
                Some(&idx) => collections[idx].rules.push(compiled),
                None => {
                    by_name.insert(spec.collection.clone(), collections.len());
                    collections.push(RuleCollection {
                        name: spec.collection.clone(),
                        action: spec.action,
                        priority: spec.priority(),
                        rule_collection_type: RuleCollectionType::Filter,
                        rules: vec![compiled],
                    });
                }
            }
        }
    }

    collections
}

fn compile_rule(spec: &RuleSpec, groups: &[String]) -> Rule {
    match &spec.kind {
        RuleKind::Network(net) => {
            let (destination_addresses, destination_fqdns) = match &net.destination {
                Destination::Addresses(addrs) => (addrs.clone(), vec![]),
                Destination::Fqdns(fqdns) => (vec![], fqdns.clone()),
            };
            Rule::Network(NetworkRule {
                name: spec.name.clone(),
                source_ip_groups: groups.to_vec(),
                destination_addresses,
                destination_fqdns,
                destination_ports: net.ports.clone(),
                ip_protocols: network_protocols(&net.protocols),
            })
        }
        RuleKind::Application(app) => Rule::Application(ApplicationRule {
            name: spec.name.clone(),
            source_ip_groups: groups.to_vec(),
            target_fqdns: app.target_fqdns.clone(),
            target_urls: app.target_urls.clone(),
            terminate_tls: app.terminate_tls(),
            protocols: application_protocols(&app.protocols),
        }),
    }
}

/// Parses `SCHEME:PORT` tokens. `HTTP` selects plain HTTP; any other scheme is HTTPS.
///
/// Tokens without a valid port are dropped.
pub fn application_protocols(tokens: &[String]) -> Vec<ApplicationProtocol> {
    tokens
        .iter()
        .filter_map(|token| {
            let (scheme, port) = match token.split_once(':') {
                Some(parts) => parts,
                None => {
                    warn!(%token, "Ignoring application protocol without a port");
                    return None;
                }
            };
            let port = match port.parse::<u16>() {
                Ok(port) => port,
                Err(error) => {
                    warn!(%token, %error, "Ignoring application protocol with an invalid port");
                    return None;
                }
            };
            let protocol_type = if scheme == "HTTP" {
                ApplicationProtocolType::Http
            } else {
                ApplicationProtocolType::Https
            };
            Some(ApplicationProtocol {
                protocol_type,
                port,
            })
        })
        .collect()
}

/// Maps protocol tokens onto network protocols. Unrecognized tokens match any protocol.
pub fn network_protocols(tokens: &[String]) -> Vec<NetworkProtocol> {
    tokens
        .iter()
        .map(|token| match token.as_str() {
            "TCP" => NetworkProtocol::Tcp,
            "UDP" => NetworkProtocol::Udp,
            "ICMP" => NetworkProtocol::Icmp,
            "Any" | "ANY" => NetworkProtocol::Any,
            _ => {
                warn!(%token, "Unrecognized network protocol; matching any protocol");
                NetworkProtocol::Any
            }
        })
        .collect()
}
