use super::{
    AddressGroup, Backend, BackendError, FirewallPolicyTarget, OperationError, OperationHandle,
    ProvisioningState,
};
use crate::policy::CompiledPolicy;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;
use tracing::debug;

/// A backend that holds address groups and the policy document in memory.
///
/// Submissions leave address groups in the `Updating` state until their operation completes, after
/// the configured provisioning delay. Failures may be injected to exercise error paths.
#[derive(Clone, Debug)]
pub struct MemoryBackend {
    target: FirewallPolicyTarget,
    provisioning_delay: Duration,
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    groups: HashMap<String, AddressGroup>,
    policy: Option<CompiledPolicy>,
    policy_pushes: usize,
    address_group_updates: usize,
    failures: Failures,
    failing_operations: HashSet<String>,
}

#[derive(Copy, Clone, Debug, Default)]
struct Failures {
    group_reads: bool,
    group_updates: bool,
    policy_pushes: bool,
    operations: bool,
}

impl MemoryBackend {
    pub fn new(target: FirewallPolicyTarget, provisioning_delay: Duration) -> Self {
        Self {
            target,
            provisioning_delay,
            state: Default::default(),
        }
    }

    pub fn target(&self) -> &FirewallPolicyTarget {
        &self.target
    }

    /// Stores an address group as though it had been provisioned out of band.
    pub fn insert_address_group(
        &self,
        name: &str,
        addresses: Vec<String>,
        provisioning_state: ProvisioningState,
    ) -> AddressGroup {
        let group = AddressGroup {
            id: self.target.address_group_id(name),
            name: name.to_string(),
            addresses,
            provisioning_state,
        };
        self.state
            .lock()
            .groups
            .insert(name.to_string(), group.clone());
        group
    }

    pub fn address_group(&self, name: &str) -> Option<AddressGroup> {
        self.state.lock().groups.get(name).cloned()
    }

    pub fn policy(&self) -> Option<CompiledPolicy> {
        self.state.lock().policy.clone()
    }

    /// The number of policy documents submitted.
    pub fn policy_pushes(&self) -> usize {
        self.state.lock().policy_pushes
    }

    /// The number of address group updates submitted.
    pub fn address_group_updates(&self) -> usize {
        self.state.lock().address_group_updates
    }

    pub fn fail_group_reads(&self, fail: bool) {
        self.state.lock().failures.group_reads = fail;
    }

    pub fn fail_group_updates(&self, fail: bool) {
        self.state.lock().failures.group_updates = fail;
    }

    pub fn fail_policy_pushes(&self, fail: bool) {
        self.state.lock().failures.policy_pushes = fail;
    }

    /// Causes subsequently submitted operations to end in the `Failed` state.
    pub fn fail_operations(&self, fail: bool) {
        self.state.lock().failures.operations = fail;
    }

    /// Causes subsequently completed operations on the named object to end in the `Failed` state.
    pub fn fail_operations_on(&self, name: &str, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_operations.insert(name.to_string());
        } else {
            state.failing_operations.remove(name);
        }
    }

    /// Completes `apply` on a background task once the provisioning delay has elapsed.
    fn provision<F>(&self, name: String, apply: F) -> OperationHandle
    where
        F: FnOnce(&mut State, bool) -> Result<(), OperationError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let state = self.state.clone();
        let delay = self.provisioning_delay;
        let object = name.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let res = {
                let mut state = state.lock();
                let fail =
                    state.failures.operations || state.failing_operations.contains(&object);
                apply(&mut *state, fail)
            };
            let _ = tx.send(res);
        });

        let op = name.clone();
        OperationHandle::new(name, async move {
            rx.await.unwrap_or_else(|_| {
                Err(OperationError {
                    name: op,
                    message: "operation abandoned".to_string(),
                })
            })
        })
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn get_address_group(&self, name: &str) -> Result<Option<AddressGroup>, BackendError> {
        let state = self.state.lock();
        if state.failures.group_reads {
            return Err(BackendError::Request(format!(
                "failed to read address group {}",
                name
            )));
        }
        Ok(state.groups.get(name).cloned())
    }

    async fn submit_address_group_update(
        &self,
        name: &str,
        addresses: &[String],
    ) -> Result<OperationHandle, BackendError> {
        {
            let mut state = self.state.lock();
            if state.failures.group_updates {
                return Err(BackendError::Rejected(format!(
                    "address group {} may not be updated",
                    name
                )));
            }
            state.address_group_updates += 1;
            let group = state
                .groups
                .entry(name.to_string())
                .or_insert_with(|| AddressGroup {
                    id: self.target.address_group_id(name),
                    name: name.to_string(),
                    addresses: vec![],
                    provisioning_state: ProvisioningState::Updating,
                });
            group.addresses = addresses.to_vec();
            group.provisioning_state = ProvisioningState::Updating;
        }
        debug!(%name, addresses = addresses.len(), "Provisioning address group");

        let group = name.to_string();
        Ok(self.provision(name.to_string(), move |state, fail| {
            let provisioned = match state.groups.get_mut(&group) {
                Some(provisioned) => provisioned,
                None => {
                    return Err(OperationError {
                        name: group,
                        message: "address group was removed".to_string(),
                    })
                }
            };
            if fail {
                provisioned.provisioning_state = ProvisioningState::Failed;
                return Err(OperationError {
                    name: group,
                    message: "provisioning failed".to_string(),
                });
            }
            provisioned.provisioning_state = ProvisioningState::Succeeded;
            Ok(())
        }))
    }

    async fn get_policy_collection_group(&self) -> Result<Option<CompiledPolicy>, BackendError> {
        Ok(self.state.lock().policy.clone())
    }

    async fn submit_policy_collection_group(
        &self,
        policy: &CompiledPolicy,
    ) -> Result<OperationHandle, BackendError> {
        {
            let mut state = self.state.lock();
            if state.failures.policy_pushes {
                return Err(BackendError::Rejected(format!(
                    "rule collection group {} may not be updated",
                    self.target.rule_collection_group
                )));
            }
            state.policy_pushes += 1;
        }

        let name = self.target.rule_collection_group.clone();
        let policy = policy.clone();
        Ok(self.provision(name.clone(), move |state, fail| {
            if fail {
                return Err(OperationError {
                    name,
                    message: "provisioning failed".to_string(),
                });
            }
            state.policy = Some(policy);
            Ok(())
        }))
    }
}
