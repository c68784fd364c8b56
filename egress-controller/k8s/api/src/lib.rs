#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod egress_rules;
pub mod taints;
pub mod validation;

pub use self::egress_rules::{
    EgressRuleSpec, EgressRules, EgressRulesSpec, FirewallAction, FirewallRuleSpec, RuleType,
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Node, NodeAddress, NodeSpec, NodeStatus, Pod, PodSpec, PodStatus, Taint},
    },
    apimachinery,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, ResourceExt},
    error::ErrorResponse,
    runtime::watcher,
    Client, CustomResourceExt, Error, Resource,
};
