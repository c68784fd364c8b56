//! Egress Firewall Controller core
//!
//! The controller keeps a remote firewall policy in line with a declarative set of egress rules and
//! the live cluster inventory. This crate holds the parts of that process that do not depend on
//! Kubernetes or on a concrete firewall transport:
//!
//! - The rule model (`rules`): egress rules select inventory objects by label and carry a list of
//!   network or application rule specs.
//! - The address resolver (`resolve`): maps a selector onto the addresses of the inventory objects
//!   that carry its label.
//! - The compiler (`compile`): turns rules plus the backend references of their address groups
//!   into an ordered policy document (`policy`).
//! - The config cache (`ConfigCache`): suppresses pushes of a document identical to the last one
//!   applied.
//! - The collaborator boundaries: `inventory::Inventory` and `backend::Backend`.
//!
//! ```text
//! [ Node/Pod ] <- [ Selector ] -> [ AddressGroup ] <- [ Rule ] -> [ RuleCollection ]
//! ```

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backend;
mod cache;
pub mod compile;
pub mod inventory;
pub mod policy;
pub mod resolve;
pub mod rules;

pub use self::{
    backend::{Backend, BackendError, OperationError, OperationHandle},
    cache::ConfigCache,
    inventory::{Inventory, ResourceKey},
};

/// The default priority of the rule collection group managed by the controller.
pub const DEFAULT_RULE_COLLECTION_GROUP_PRIORITY: i32 = 400;
