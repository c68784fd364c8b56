//! The firewall backend boundary.
//!
//! The backend stores named address groups and a single policy document. Mutations are
//! asynchronous: a submission returns an [`OperationHandle`] that completes once the backend has
//! provisioned the change.

mod memory;

pub use self::memory::MemoryBackend;
use crate::policy::CompiledPolicy;
use futures::{
    future::{self, BoxFuture, Shared},
    prelude::*,
};
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// An error returned when a backend request could not be issued or was refused.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(String),

    #[error("backend rejected the request: {0}")]
    Rejected(String),
}

/// An error reported by a submitted operation that did not provision successfully.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("operation {name} failed: {message}")]
pub struct OperationError {
    pub name: String,
    pub message: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProvisioningState {
    Succeeded,
    Updating,
    Failed,
}

/// A backend-held set of addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressGroup {
    /// The opaque reference used by compiled rules.
    pub id: String,
    pub name: String,
    pub addresses: Vec<String>,
    pub provisioning_state: ProvisioningState,
}

/// Tracks an in-flight backend mutation.
///
/// Handles are cheap to clone; every clone observes the same completion.
#[derive(Clone)]
pub struct OperationHandle {
    id: u64,
    name: String,
    inner: Shared<BoxFuture<'static, Result<(), OperationError>>>,
}

#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn get_address_group(&self, name: &str) -> Result<Option<AddressGroup>, BackendError>;

    async fn submit_address_group_update(
        &self,
        name: &str,
        addresses: &[String],
    ) -> Result<OperationHandle, BackendError>;

    async fn get_policy_collection_group(&self) -> Result<Option<CompiledPolicy>, BackendError>;

    async fn submit_policy_collection_group(
        &self,
        policy: &CompiledPolicy,
    ) -> Result<OperationHandle, BackendError>;
}

/// Identifies the rule collection group the controller manages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallPolicyTarget {
    pub subscription_id: String,
    pub resource_group: String,
    pub policy_name: String,
    pub rule_collection_group: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid firewall policy resource id: {0}")]
pub struct InvalidResourceId(String);

// === impl OperationHandle ===

impl OperationHandle {
    pub fn new<F>(name: impl Into<String>, completion: F) -> Self
    where
        F: Future<Output = Result<(), OperationError>> + Send + 'static,
    {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            inner: completion.boxed().shared(),
        }
    }

    /// Returns a handle that has already completed successfully.
    pub fn ready(name: impl Into<String>) -> Self {
        Self::new(name, future::ok(()))
    }

    /// Returns a handle that has already failed.
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let error = OperationError {
            name: name.clone(),
            message: message.into(),
        };
        Self::new(name, future::err(error))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The name of the resource being mutated.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the operation to reach a terminal state.
    pub async fn await_completion(&self) -> Result<(), OperationError> {
        self.inner.clone().await
    }

    /// Returns true if both handles track the same submission.
    pub fn is_same(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("complete", &self.inner.peek().is_some())
            .finish()
    }
}

// === impl FirewallPolicyTarget ===

impl FirewallPolicyTarget {
    /// Parses a `/subscriptions/{s}/resourceGroups/{g}/providers/{p}/firewallPolicies/{name}`
    /// resource id.
    pub fn from_resource_id(
        resource_id: &str,
        rule_collection_group: impl Into<String>,
    ) -> Result<Self, InvalidResourceId> {
        let segments = resource_id.split('/').collect::<Vec<_>>();
        if segments.len() < 9 {
            return Err(InvalidResourceId(resource_id.to_string()));
        }
        Ok(Self {
            subscription_id: segments[2].to_string(),
            resource_group: segments[4].to_string(),
            policy_name: segments[8].to_string(),
            rule_collection_group: rule_collection_group.into(),
        })
    }

    /// The resource id of an address group in the policy's resource group.
    pub fn address_group_id(&self, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/ipGroups/{}",
            self.subscription_id, self.resource_group, name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resource_id() {
        let target = FirewallPolicyTarget::from_resource_id(
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/firewallPolicies/fw",
            "egress",
        )
        .expect("resource id must parse");
        assert_eq!(
            target,
            FirewallPolicyTarget {
                subscription_id: "sub".into(),
                resource_group: "rg".into(),
                policy_name: "fw".into(),
                rule_collection_group: "egress".into(),
            }
        );
        assert_eq!(
            target.address_group_id("ipgroup-node-env-prod"),
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/ipGroups/ipgroup-node-env-prod"
        );
    }

    #[test]
    fn rejects_short_resource_id() {
        assert!(FirewallPolicyTarget::from_resource_id("/subscriptions/sub", "egress").is_err());
    }

    #[tokio::test]
    async fn handles_share_completion() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = OperationHandle::new("group", async move {
            rx.await.map_err(|_| OperationError {
                name: "group".into(),
                message: "canceled".into(),
            })
        });
        let clone = handle.clone();
        assert!(clone.is_same(&handle));
        assert!(!handle.is_same(&OperationHandle::ready("group")));

        tx.send(()).expect("receiver must be held");
        assert_eq!(handle.await_completion().await, Ok(()));
        assert_eq!(clone.await_completion().await, Ok(()));
    }

    #[tokio::test]
    async fn failed_handle_reports_error() {
        let handle = OperationHandle::failed("group", "boom");
        let error = handle.await_completion().await.unwrap_err();
        assert_eq!(error.name, "group");
        assert_eq!(error.message, "boom");
    }
}
