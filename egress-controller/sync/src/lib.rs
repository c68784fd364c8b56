//! Reconciliation engine for the egress firewall controller.
//!
//! Inventory and rule changes are queued by resource key. A single worker drains the queue, at
//! most once per minimum interval, and runs a pass that:
//!
//! 1. resolves each rule selector to the addresses of the objects it matches;
//! 2. brings each backend address group in line with those addresses;
//! 3. compiles the rules into a policy document that references the groups;
//! 4. pushes the document unless it matches the last one applied;
//! 5. waits, off the worker, for the submitted group operations and then releases the update gates
//!    held by the resources that triggered the pass.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod coordinator;
pub mod metrics;
pub mod queue;
mod reconcile;
mod sync;

#[cfg(test)]
mod tests;

pub use self::{
    metrics::{QueueMetrics, ReconcileMetrics},
    queue::{Batch, Enqueue, Worker},
    reconcile::{PassOutcome, PolicyOutcome, Reconciler},
    sync::{AddressGroupSync, PendingOperations, SyncError, SyncOutcome},
};
