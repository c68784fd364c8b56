use crate::egress_rules::{EgressRuleSpec, EgressRulesSpec, FirewallRuleSpec, RuleType};
use egress_controller_core::rules::{
    Action, ApplicationRuleSpec, Destination, NetworkRuleSpec, RuleKind, RuleSpec,
};
use std::collections::{hash_map::Entry, HashMap};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("egress rule {0} must set nodeSelector or podSelector")]
    MissingSelector(String),

    #[error("rule {0}: targetFqdns is required for Application rules")]
    MissingTargetFqdns(String),

    #[error("rule {0}: destination fields are not supported by Application rules")]
    DestinationOnApplicationRule(String),

    #[error("rule {0}: targetFqdns and targetUrls are not supported by Network rules")]
    TargetOnNetworkRule(String),

    #[error("rule {0}: only one of destinationAddresses and destinationFqdns may be set")]
    MultipleDestinations(String),

    #[error("rule {0}: one of destinationAddresses or destinationFqdns is required")]
    MissingDestination(String),

    #[error("rule {0}: destinationPorts is required for Network rules")]
    MissingDestinationPorts(String),

    #[error("priority {priority} is used by rule collections {first} and {second}")]
    DuplicatePriority {
        priority: i32,
        first: String,
        second: String,
    },

    #[error("rule collection {0} is declared with conflicting actions, priorities or rule types")]
    InconsistentCollection(String),
}

/// Validates a whole resource.
///
/// Every rule must satisfy the field rules of its kind. Across the resource, a rule collection name
/// must always carry the same action, priority and rule type, and no priority may be shared by two
/// collection names.
pub fn validate_spec(spec: &EgressRulesSpec) -> Result<(), ValidationError> {
    let mut priorities = HashMap::<i32, &str>::new();
    let mut collections = HashMap::<&str, (Action, i32, RuleType)>::new();

    for egress in &spec.egress_rules {
        validate_selectors(egress)?;

        for rule in &egress.rules {
            let compiled = rule.to_rule_spec()?;
            let priority = compiled.priority();

            match priorities.entry(priority) {
                Entry::Vacant(entry) => {
                    entry.insert(&rule.rule_collection_name);
                }
                Entry::Occupied(entry) => {
                    if *entry.get() != rule.rule_collection_name {
                        return Err(ValidationError::DuplicatePriority {
                            priority,
                            first: entry.get().to_string(),
                            second: rule.rule_collection_name.clone(),
                        });
                    }
                }
            }

            let declared = (compiled.action, priority, rule.rule_type);
            match collections.entry(&rule.rule_collection_name) {
                Entry::Vacant(entry) => {
                    entry.insert(declared);
                }
                Entry::Occupied(entry) => {
                    if *entry.get() != declared {
                        return Err(ValidationError::InconsistentCollection(
                            rule.rule_collection_name.clone(),
                        ));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Describes protocol tokens that are admitted but cannot be compiled as written.
pub fn protocol_warnings(spec: &EgressRulesSpec) -> Vec<String> {
    let mut warnings = Vec::new();
    for rule in spec.egress_rules.iter().flat_map(|egress| egress.rules.iter()) {
        for token in &rule.protocol {
            match rule.rule_type {
                RuleType::Network => {
                    if !matches!(token.as_str(), "TCP" | "UDP" | "ICMP" | "Any" | "ANY") {
                        warnings.push(format!(
                            "rule {}: unrecognized protocol {:?} matches any protocol",
                            rule.rule_name, token
                        ));
                    }
                }
                RuleType::Application => {
                    let valid = token
                        .split_once(':')
                        .map_or(false, |(_, port)| port.parse::<u16>().is_ok());
                    if !valid {
                        warnings.push(format!(
                            "rule {}: protocol {:?} is not of the form SCHEME:PORT and is ignored",
                            rule.rule_name, token
                        ));
                    }
                }
            }
        }
    }
    warnings
}

fn validate_selectors(egress: &EgressRuleSpec) -> Result<(), ValidationError> {
    let selects = egress
        .node_selector
        .iter()
        .chain(egress.pod_selector.iter())
        .flatten()
        .any(|labels| !labels.is_empty());
    if !selects {
        return Err(ValidationError::MissingSelector(egress.name.clone()));
    }
    Ok(())
}

// === impl FirewallRuleSpec ===

impl FirewallRuleSpec {
    /// Converts the flat resource representation into a rule spec, enforcing the field rules of the
    /// rule's kind.
    pub fn to_rule_spec(&self) -> Result<RuleSpec, ValidationError> {
        let name = &self.rule_name;
        let kind = match self.rule_type {
            RuleType::Application => {
                if self.destination_addresses.is_some()
                    || self.destination_fqdns.is_some()
                    || self.destination_ports.is_some()
                {
                    return Err(ValidationError::DestinationOnApplicationRule(name.clone()));
                }
                let target_fqdns = self
                    .target_fqdns
                    .clone()
                    .ok_or_else(|| ValidationError::MissingTargetFqdns(name.clone()))?;
                RuleKind::Application(ApplicationRuleSpec {
                    target_fqdns,
                    target_urls: self.target_urls.clone().unwrap_or_default(),
                    protocols: self.protocol.clone(),
                })
            }

            RuleType::Network => {
                if self.target_fqdns.is_some() || self.target_urls.is_some() {
                    return Err(ValidationError::TargetOnNetworkRule(name.clone()));
                }
                let destination = match (&self.destination_addresses, &self.destination_fqdns) {
                    (Some(_), Some(_)) => {
                        return Err(ValidationError::MultipleDestinations(name.clone()))
                    }
                    (Some(addrs), None) => Destination::Addresses(addrs.clone()),
                    (None, Some(fqdns)) => Destination::Fqdns(fqdns.clone()),
                    (None, None) => return Err(ValidationError::MissingDestination(name.clone())),
                };
                let ports = self
                    .destination_ports
                    .clone()
                    .ok_or_else(|| ValidationError::MissingDestinationPorts(name.clone()))?;
                RuleKind::Network(NetworkRuleSpec {
                    destination,
                    ports,
                    protocols: self.protocol.clone(),
                })
            }
        };

        Ok(RuleSpec {
            collection: self.rule_collection_name.clone(),
            name: self.rule_name.clone(),
            priority: self.priority,
            action: self.action.into(),
            kind,
        })
    }
}
