//! A deduplicating dispatch queue drained by a single rate-limited worker.
//!
//! A key is accepted only while it is not already waiting in the queue. Once the worker dequeues a
//! key it may be enqueued again, so a change observed while a pass is running is never lost but
//! never runs concurrently with itself.

use crate::metrics::QueueMetrics;
use ahash::AHashSet as HashSet;
use parking_lot::Mutex;
use std::{fmt, hash::Hash, sync::Arc};
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant},
};
use tracing::{debug, warn};

/// Creates a queue that holds at most `capacity` keys.
pub fn channel<K>(capacity: usize, metrics: QueueMetrics) -> (Enqueue<K>, Dequeue<K>)
where
    K: Clone + Eq + Hash,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let queued = Arc::new(Mutex::new(HashSet::new()));
    let enqueue = Enqueue {
        tx,
        queued: queued.clone(),
        metrics,
    };
    (enqueue, Dequeue { rx, queued })
}

pub struct Enqueue<K> {
    tx: mpsc::Sender<K>,
    queued: Arc<Mutex<HashSet<K>>>,
    metrics: QueueMetrics,
}

pub struct Dequeue<K> {
    rx: mpsc::Receiver<K>,
    queued: Arc<Mutex<HashSet<K>>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("dispatch queue closed")]
pub struct Closed(());

/// The jobs handled by a single pass: the key that woke the worker and the keys that were already
/// waiting behind it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch<K> {
    pub trigger: K,
    pub coalesced: Vec<K>,
}

#[async_trait::async_trait]
pub trait Process<K: Send + 'static>: Send + 'static {
    async fn process(&mut self, batch: Batch<K>) -> anyhow::Result<()>;
}

/// Processes batches from a queue, starting passes no more often than `min_interval`.
pub struct Worker<K, P> {
    jobs: Dequeue<K>,
    process: P,
    min_interval: Duration,
    max_batch: usize,
}

// === impl Enqueue ===

impl<K> Enqueue<K>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    /// Queues `key` unless it is already waiting.
    ///
    /// Returns `false` when the key was already queued. Waits for capacity when the queue is full.
    /// The key is only marked as queued once a slot has been reserved for it, so dropping this
    /// future while it waits leaves no trace.
    pub async fn enqueue(&self, key: K) -> Result<bool, Closed> {
        if self.queued.lock().contains(&key) {
            return Ok(self.deduplicated(&key));
        }

        let permit = self.tx.reserve().await.map_err(|_| Closed(()))?;
        {
            let mut queued = self.queued.lock();
            if !queued.insert(key.clone()) {
                // Queued by another handle while this one waited for capacity.
                return Ok(self.deduplicated(&key));
            }
            permit.send(key.clone());
        }
        debug!(%key, "Queued");
        self.metrics.jobs.inc();
        Ok(true)
    }

    fn deduplicated(&self, key: &K) -> bool {
        debug!(%key, "Already queued");
        self.metrics.deduplicated.inc();
        false
    }
}

impl<K> Clone for Enqueue<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            queued: self.queued.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<K> fmt::Debug for Enqueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enqueue")
            .field("queued", &self.queued.lock().len())
            .finish()
    }
}

// === impl Dequeue ===

impl<K: Eq + Hash> Dequeue<K> {
    /// Waits for the next key, clearing its queued flag. Returns `None` once every `Enqueue` handle
    /// has been dropped.
    pub async fn dequeue(&mut self) -> Option<K> {
        let key = self.rx.recv().await?;
        self.queued.lock().remove(&key);
        Some(key)
    }

    /// Takes up to `max` keys that are already waiting, without blocking.
    pub fn drain(&mut self, max: usize) -> Vec<K> {
        let mut keys = Vec::new();
        while keys.len() < max {
            match self.rx.try_recv() {
                Ok(key) => {
                    self.queued.lock().remove(&key);
                    keys.push(key);
                }
                Err(_) => break,
            }
        }
        keys
    }
}

// === impl Batch ===

impl<K> Batch<K> {
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        std::iter::once(&self.trigger).chain(self.coalesced.iter())
    }
}

// === impl Worker ===

impl<K, P> Worker<K, P>
where
    K: Clone + Eq + Hash + fmt::Display + Send + 'static,
    P: Process<K>,
{
    pub fn new(jobs: Dequeue<K>, process: P, min_interval: Duration, max_batch: usize) -> Self {
        Self {
            jobs,
            process,
            min_interval,
            max_batch: max_batch.max(1),
        }
    }

    /// Runs passes until the shutdown signal fires or every `Enqueue` handle is dropped.
    ///
    /// A failed pass is logged and does not stop the worker.
    pub async fn run(mut self, shutdown: drain::Watch) {
        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);

        let mut last_start = None::<Instant>;
        loop {
            let trigger = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!("Shutdown signaled");
                    return;
                }
                job = self.jobs.dequeue() => match job {
                    Some(key) => key,
                    None => {
                        debug!("Queue closed");
                        return;
                    }
                },
            };

            if let Some(last) = last_start {
                let next = last + self.min_interval;
                if next > Instant::now() {
                    debug!(%trigger, delay = ?(next - Instant::now()), "Waiting for the minimum update interval");
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => {
                            debug!("Shutdown signaled");
                            return;
                        }
                        _ = time::sleep_until(next) => {}
                    }
                }
            }

            let mut seen = HashSet::new();
            seen.insert(trigger.clone());
            let coalesced = self
                .jobs
                .drain(self.max_batch - 1)
                .into_iter()
                .filter(|key| seen.insert(key.clone()))
                .collect::<Vec<_>>();

            last_start = Some(Instant::now());
            let batch = Batch { trigger, coalesced };
            debug!(trigger = %batch.trigger, coalesced = batch.coalesced.len(), "Processing");
            if let Err(error) = self.process.process(batch).await {
                warn!(%error, "Reconciliation failed");
            }
        }
    }
}
