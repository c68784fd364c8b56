use crate::sync::PendingOperations;
use egress_controller_core::{Inventory, OperationHandle, ResourceKey};
use futures::future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Waits for every operation submitted during a pass and then releases the update gate on each of
/// `release`.
///
/// Operations are awaited concurrently. Failed operations are logged and do not hold back the
/// release; the next pass retries their groups.
pub async fn complete<I: Inventory>(
    inventory: Arc<I>,
    pending: PendingOperations,
    operations: Vec<OperationHandle>,
    release: Vec<ResourceKey>,
) {
    if !operations.is_empty() {
        debug!(operations = operations.len(), "Waiting for address group operations");
    }
    let tasks = operations.into_iter().map(|operation| {
        let pending = pending.clone();
        tokio::spawn(async move {
            let res = operation.await_completion().await;
            pending.complete(&operation);
            res
        })
    });

    for res in future::join_all(tasks).await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(%error, "Address group operation failed"),
            Err(error) => warn!(%error, "Address group operation task failed"),
        }
    }

    for key in release {
        match inventory.set_gate(&key, false).await {
            Ok(()) => info!(%key, "Released update gate"),
            Err(error) => warn!(%key, %error, "Failed to release update gate"),
        }
    }
}
