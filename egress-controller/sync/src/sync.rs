use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use egress_controller_core::{
    backend::{AddressGroup, ProvisioningState},
    Backend, BackendError, OperationHandle,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// The in-flight operation for each address group, by group name.
///
/// Entries are added when an update is submitted and removed when that operation completes, unless a
/// newer submission has replaced it in the meantime.
#[derive(Clone, Debug, Default)]
pub struct PendingOperations(Arc<Mutex<HashMap<String, OperationHandle>>>);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("address group {0} was not found after it was updated")]
    Missing(String),
}

#[derive(Debug)]
pub enum SyncOutcome {
    Unchanged { id: String },
    Updated { id: String, operation: OperationHandle },
}

/// Reconciles backend address groups with their desired addresses.
#[derive(Debug)]
pub struct AddressGroupSync<B> {
    backend: Arc<B>,
    pending: PendingOperations,
}

// === impl PendingOperations ===

impl PendingOperations {
    pub fn get(&self, name: &str) -> Option<OperationHandle> {
        self.0.lock().get(name).cloned()
    }

    pub fn insert(&self, operation: OperationHandle) {
        self.0
            .lock()
            .insert(operation.name().to_string(), operation);
    }

    /// Forgets `operation` if it is still the latest operation for its group.
    pub fn complete(&self, operation: &OperationHandle) -> bool {
        let mut ops = self.0.lock();
        match ops.get(operation.name()) {
            Some(current) if current.is_same(operation) => {
                ops.remove(operation.name());
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

// === impl SyncOutcome ===

impl SyncOutcome {
    /// The backend id of the synchronized group.
    pub fn id(&self) -> &str {
        match self {
            Self::Unchanged { id } => id,
            Self::Updated { id, .. } => id,
        }
    }
}

// === impl AddressGroupSync ===

impl<B: Backend> AddressGroupSync<B> {
    pub fn new(backend: Arc<B>, pending: PendingOperations) -> Self {
        Self { backend, pending }
    }

    /// Ensures the backend group `name` holds exactly `desired`, submitting an update if it does
    /// not.
    ///
    /// If the group is mid-update and its operation is known, that operation is awaited before the
    /// group is compared, so at most one update is in flight per group.
    pub async fn sync(&self, name: &str, desired: &[String]) -> Result<SyncOutcome, SyncError> {
        let mut current = self.backend.get_address_group(name).await?;

        let in_flight = match current.as_ref() {
            Some(group) if group.provisioning_state == ProvisioningState::Updating => {
                self.pending.get(name)
            }
            _ => None,
        };
        if let Some(operation) = in_flight {
            debug!(%name, "Waiting for in-flight address group update");
            if let Err(error) = operation.await_completion().await {
                debug!(%error, "In-flight address group update failed");
            }
            self.pending.complete(&operation);
            current = self.backend.get_address_group(name).await?;
        }

        if let Some(group) = current.as_ref() {
            if !needs_update(group, desired) {
                debug!(%name, id = %group.id, "Address group is up to date");
                return Ok(SyncOutcome::Unchanged {
                    id: group.id.clone(),
                });
            }
        }

        info!(%name, addresses = desired.len(), "Updating address group");
        let operation = self
            .backend
            .submit_address_group_update(name, desired)
            .await?;
        self.pending.insert(operation.clone());

        let group = self
            .backend
            .get_address_group(name)
            .await?
            .ok_or_else(|| SyncError::Missing(name.to_string()))?;
        Ok(SyncOutcome::Updated {
            id: group.id,
            operation,
        })
    }
}

/// A group must be updated unless it has settled with exactly the desired addresses.
pub fn needs_update(group: &AddressGroup, desired: &[String]) -> bool {
    group.provisioning_state != ProvisioningState::Succeeded
        || addresses_differ(&group.addresses, desired)
}

/// Compares address lists as sets.
pub fn addresses_differ(current: &[String], desired: &[String]) -> bool {
    let current = current.iter().map(String::as_str).collect::<HashSet<_>>();
    let desired = desired.iter().map(String::as_str).collect::<HashSet<_>>();
    current.symmetric_difference(&desired).next().is_some()
}
