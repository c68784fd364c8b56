use crate::{index::Event, inventory::set_node_gate};
use egress_controller_core::inventory::ResourceKey;
use egress_controller_k8s_api as k8s;
use egress_controller_sync::Enqueue;
use tokio::sync::mpsc;

/// Acts on the events published by the index.
///
/// Reconciliation requests are handed to the dispatch queue. Gate changes that do not need a
/// reconciliation pass are written directly.
pub struct Controller {
    events: mpsc::UnboundedReceiver<Event>,
    queue: Enqueue<ResourceKey>,
    client: k8s::Client,
}

impl Controller {
    pub fn new(
        events: mpsc::UnboundedReceiver<Event>,
        queue: Enqueue<ResourceKey>,
        client: k8s::Client,
    ) -> Self {
        Self {
            events,
            queue,
            client,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                Event::Reconcile(key) => {
                    if self.queue.enqueue(key).await.is_err() {
                        tracing::debug!("Dispatch queue closed");
                        return;
                    }
                }

                Event::Gate(name) => self.set_gate(name, true),
                Event::Release(name) => self.set_gate(name, false),
            }
        }
    }

    fn set_gate(&self, name: String, present: bool) {
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(error) = set_node_gate(&client, &name, present).await {
                tracing::warn!(%name, present, %error, "Failed to update node gate");
            }
        });
    }
}
