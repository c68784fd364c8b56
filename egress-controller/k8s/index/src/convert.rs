use egress_controller_core::rules::{EgressRule, Selector};
use egress_controller_k8s_api::{EgressRuleSpec, EgressRules, ResourceExt};
use std::collections::BTreeMap;
use tracing::warn;

/// Converts an `EgressRules` resource into the rules it declares.
///
/// Rule names are qualified by the resource name. Rules that fail validation are skipped so that
/// one malformed entry does not block the rest of the resource.
pub(crate) fn egress_rules(resource: &EgressRules) -> Vec<EgressRule> {
    let resource_name = resource.name_unchecked();
    resource
        .spec
        .egress_rules
        .iter()
        .map(|spec| EgressRule {
            name: format!("{}/{}", resource_name, spec.name),
            selectors: selectors(spec),
            rules: spec
                .rules
                .iter()
                .filter_map(|rule| match rule.to_rule_spec() {
                    Ok(rule) => Some(rule),
                    Err(error) => {
                        warn!(
                            resource = %resource_name,
                            egress = %spec.name,
                            %error,
                            "Skipping invalid rule"
                        );
                        None
                    }
                })
                .collect(),
        })
        .collect()
}

/// Every `key: value` pair of every selector map becomes its own selector.
fn selectors(spec: &EgressRuleSpec) -> Vec<Selector> {
    fn pairs(
        maps: &Option<Vec<BTreeMap<String, String>>>,
    ) -> impl Iterator<Item = (&String, &String)> {
        maps.iter().flatten().flat_map(|map| map.iter())
    }

    let nodes = pairs(&spec.node_selector).map(|(k, v)| Selector::node(k, v));
    let pods = pairs(&spec.pod_selector).map(|(k, v)| Selector::pod(k, v));
    let mut selectors = Vec::new();
    for selector in nodes.chain(pods) {
        if !selectors.contains(&selector) {
            selectors.push(selector);
        }
    }
    selectors
}

#[cfg(test)]
mod tests {
    use super::*;
    use egress_controller_core::rules::SelectorKind;
    use egress_controller_k8s_api::{
        EgressRulesSpec, FirewallAction, FirewallRuleSpec, ObjectMeta, RuleType,
    };
    use maplit::btreemap;

    fn rule(name: &str, rule_type: RuleType) -> FirewallRuleSpec {
        FirewallRuleSpec {
            rule_collection_name: "net".to_string(),
            priority: None,
            rule_name: name.to_string(),
            destination_addresses: Some(vec!["*".to_string()]),
            destination_ports: Some(vec!["443".to_string()]),
            destination_fqdns: None,
            target_fqdns: None,
            target_urls: None,
            protocol: vec!["TCP".to_string()],
            action: FirewallAction::Allow,
            rule_type,
        }
    }

    #[test]
    fn converts_resource() {
        let resource = EgressRules {
            metadata: ObjectMeta {
                name: Some("egress".to_string()),
                ..ObjectMeta::default()
            },
            spec: EgressRulesSpec {
                egress_rules: vec![EgressRuleSpec {
                    name: "web".to_string(),
                    node_selector: Some(vec![
                        btreemap! {
                            "env".to_string() => "prod".to_string(),
                            "zone".to_string() => "a".to_string(),
                        },
                        btreemap! { "env".to_string() => "prod".to_string() },
                    ]),
                    pod_selector: Some(vec![btreemap! {
                        "app".to_string() => "web".to_string(),
                    }]),
                    // The application rule lacks target FQDNs and is skipped.
                    rules: vec![
                        rule("valid", RuleType::Network),
                        rule("invalid", RuleType::Application),
                    ],
                }],
            },
        };

        let rules = egress_rules(&resource);
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.name, "egress/web");
        assert_eq!(
            rule.selectors,
            vec![
                Selector::node("env", "prod"),
                Selector::node("zone", "a"),
                Selector::pod("app", "web"),
            ]
        );
        assert_eq!(rule.selectors[2].kind, SelectorKind::Pod);
        assert_eq!(rule.rules.len(), 1);
        assert_eq!(rule.rules[0].name, "valid");
    }
}
