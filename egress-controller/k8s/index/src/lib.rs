//! Kubernetes inventory for the egress firewall controller.
//!
//! The index watches the following cluster resources:
//!
//! - Each `EgressRules` resource declares rules whose selectors match nodes or pods by label.
//! - Each `Node` contributes its primary address to the groups of the node selectors matching its
//!   labels. A node that is still joining the cluster is gated with a `NoSchedule` taint until the
//!   first pass including it has been applied.
//! - Each running `Pod` contributes its host address to the groups of matching pod selectors.
//!
//! Updates that cannot change the compiled policy, such as a resync of an unchanged node or a pod
//! that no selector matches, are filtered out before reaching the dispatch queue.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod convert;
mod index;
mod inventory;


pub use self::{
    controller::Controller,
    index::{Event, Index, SharedIndex},
    inventory::KubeInventory,
};
