use crate::{
    coordinator,
    metrics::ReconcileMetrics,
    queue::{Batch, Process},
    sync::{AddressGroupSync, PendingOperations, SyncOutcome},
};
use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use egress_controller_core::{
    compile::{self, SourceGroups},
    policy::CompiledPolicy,
    resolve::Snapshot,
    Backend, ConfigCache, Inventory, ResourceKey,
};
use std::sync::Arc;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// Runs reconciliation passes against an inventory and a firewall backend.
///
/// A reconciler is owned by the single queue worker; the config cache is only touched from its
/// passes.
pub struct Reconciler<I, B> {
    inventory: Arc<I>,
    backend: Arc<B>,
    groups: AddressGroupSync<B>,
    pending: PendingOperations,
    cache: ConfigCache,
    primed: bool,
    priority: i32,
    metrics: ReconcileMetrics,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// The compiled document matched the last applied document.
    Unchanged,
    Applied,

    /// The document was not applied and the pass's gates were left in place. They are released
    /// by a later pass, which the index triggers when a gated node is next updated.
    Failed,
}

#[derive(Debug)]
pub struct PassOutcome {
    pub policy: PolicyOutcome,

    /// Completes once the pass's address group operations have settled and its gates have been
    /// released.
    pub completion: JoinHandle<()>,
}

// === impl Reconciler ===

impl<I: Inventory, B: Backend> Reconciler<I, B> {
    pub fn new(
        inventory: Arc<I>,
        backend: Arc<B>,
        priority: i32,
        metrics: ReconcileMetrics,
    ) -> Self {
        let pending = PendingOperations::default();
        Self {
            groups: AddressGroupSync::new(backend.clone(), pending.clone()),
            inventory,
            backend,
            pending,
            cache: ConfigCache::default(),
            primed: false,
            priority,
            metrics,
        }
    }

    pub fn pending(&self) -> &PendingOperations {
        &self.pending
    }

    /// Runs a single pass for the resources in `batch`.
    ///
    /// All state is re-read from the inventory. Inventory read errors abort the pass; address
    /// group and policy errors are logged and leave the affected rules (or the whole document) to be
    /// retried by a later pass.
    pub async fn reconcile(&mut self, batch: &Batch<ResourceKey>) -> Result<PassOutcome> {
        self.prime().await;

        let rules = self
            .inventory
            .list_rules()
            .await
            .context("failed to list egress rules")?;
        let snapshot = Snapshot {
            nodes: self
                .inventory
                .list_nodes()
                .await
                .context("failed to list nodes")?,
            pods: self
                .inventory
                .list_pods()
                .await
                .context("failed to list pods")?,
        };
        let gated = self.gated_resources(batch).await;

        // Group names are shared by every rule with the same selector, so each group is
        // synchronized at most once per pass.
        let mut synced = HashMap::<String, Option<String>>::new();
        let mut operations = Vec::new();
        let mut sources = SourceGroups::new();
        for rule in &rules {
            let mut ids = Vec::with_capacity(rule.selectors.len());
            let mut complete = true;
            for selector in &rule.selectors {
                let name = selector.address_group_name();
                let id = match synced.get(&name) {
                    Some(id) => id.clone(),
                    None => {
                        let addresses = snapshot.resolve(selector);
                        let id = match self.groups.sync(&name, &addresses).await {
                            Ok(SyncOutcome::Unchanged { id }) => Some(id),
                            Ok(SyncOutcome::Updated { id, operation }) => {
                                self.metrics.address_group_updates.inc();
                                operations.push(operation);
                                Some(id)
                            }
                            Err(error) => {
                                warn!(%name, %selector, %error, "Failed to synchronize address group");
                                None
                            }
                        };
                        synced.insert(name, id.clone());
                        id
                    }
                };
                match id {
                    Some(id) if !ids.contains(&id) => ids.push(id),
                    Some(_) => {}
                    None => complete = false,
                }
            }

            if complete {
                sources.insert(rule.name.clone(), ids);
            } else {
                warn!(rule = %rule.name, "Omitting rule with unsynchronized address groups");
            }
        }

        let policy = compile::compile_policy(self.priority, &rules, &sources);
        let outcome = self.push(&policy).await;

        let release = match outcome {
            PolicyOutcome::Failed => {
                if !gated.is_empty() {
                    debug!(gates = gated.len(), "Holding update gates until the policy is applied");
                }
                Vec::new()
            }
            PolicyOutcome::Applied | PolicyOutcome::Unchanged => gated,
        };
        let completion = tokio::spawn(
            coordinator::complete(
                self.inventory.clone(),
                self.pending.clone(),
                operations,
                release,
            )
            .instrument(info_span!("completion", trigger = %batch.trigger)),
        );

        Ok(PassOutcome {
            policy: outcome,
            completion,
        })
    }

    /// Seeds the config cache with the document the backend currently holds.
    async fn prime(&mut self) {
        if self.primed {
            return;
        }
        match self.backend.get_policy_collection_group().await {
            Ok(Some(current)) => {
                debug!(collections = current.rule_collections.len(), "Loaded current policy");
                self.cache.update(&current);
            }
            Ok(None) => debug!("No policy applied yet"),
            Err(error) => {
                warn!(%error, "Failed to read the current policy");
                return;
            }
        }
        self.primed = true;
    }

    /// Returns the resources in `batch` whose gates may be released once this pass has settled.
    async fn gated_resources(&self, batch: &Batch<ResourceKey>) -> Vec<ResourceKey> {
        let mut gated = Vec::new();
        for key in batch.keys() {
            if let ResourceKey::Rules(_) = key {
                continue;
            }
            match self.inventory.get_resource(key).await {
                Ok(Some(state)) if state.gated && state.ready => gated.push(key.clone()),
                Ok(_) => {}
                Err(error) => warn!(%key, %error, "Failed to read resource"),
            }
        }
        gated
    }

    async fn push(&mut self, policy: &CompiledPolicy) -> PolicyOutcome {
        if self.cache.is_unchanged(policy) {
            debug!("Policy unchanged");
            self.metrics.policy_push_skipped.inc();
            return PolicyOutcome::Unchanged;
        }

        match policy.to_pretty_json() {
            Ok(document) => debug!(%document, "Applying policy"),
            Err(error) => debug!(%error, "Failed to render policy"),
        }

        let res = async {
            let operation = self
                .backend
                .submit_policy_collection_group(policy)
                .await?;
            operation.await_completion().await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;

        match res {
            Ok(()) => {
                info!(
                    collections = policy.rule_collections.len(),
                    "Applied firewall policy"
                );
                self.cache.update(policy);
                self.metrics.policy_pushes.inc();
                PolicyOutcome::Applied
            }
            Err(error) => {
                warn!(%error, "Failed to apply firewall policy");
                self.cache.invalidate();
                PolicyOutcome::Failed
            }
        }
    }
}

#[async_trait::async_trait]
impl<I: Inventory, B: Backend> Process<ResourceKey> for Reconciler<I, B> {
    async fn process(&mut self, batch: Batch<ResourceKey>) -> Result<()> {
        let start = Instant::now();
        let res = self.reconcile(&batch).await;
        let elapsed = start.elapsed();
        self.metrics.passes.inc();
        self.metrics.duration.observe(elapsed.as_secs_f64());

        match res {
            Ok(PassOutcome {
                policy: PolicyOutcome::Failed,
                ..
            }) => {
                self.metrics.failures.inc();
                anyhow::bail!("firewall policy was not applied")
            }
            Ok(_) => {
                debug!(?elapsed, "Reconciled");
                Ok(())
            }
            Err(error) => {
                self.metrics.failures.inc();
                Err(error)
            }
        }
    }
}
