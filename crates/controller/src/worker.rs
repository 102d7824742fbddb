//! Worker loop: get, sync, apply retry policy, done.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use recertify_core::ResourceKey;
use recertify_queue::WorkQueue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::reconcile::{Reconciler, SyncError};
use crate::retry;
use crate::sink::ErrorSink;

/// Delay before a crashed worker is started again.
pub const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Releases the in-flight marker even if the worker task unwinds.
struct DoneGuard<'a> {
    queue: &'a WorkQueue<ResourceKey>,
    key: &'a ResourceKey,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

pub struct Worker {
    queue: WorkQueue<ResourceKey>,
    reconciler: Reconciler,
    sink: Arc<dyn ErrorSink>,
}

impl Worker {
    pub fn new(queue: WorkQueue<ResourceKey>, reconciler: Reconciler, sink: Arc<dyn ErrorSink>) -> Self {
        Self { queue, reconciler, sink }
    }

    pub fn queue(&self) -> &WorkQueue<ResourceKey> {
        &self.queue
    }

    /// Handle one item. Returns `false` once the queue is shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let _done = DoneGuard { queue: &self.queue, key: &key };

        let started = Instant::now();
        // a panicking sync is a failed attempt like any other
        let result = match AssertUnwindSafe(self.reconciler.sync(&key)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(%key, "sync panicked");
                Err(SyncError::Panicked(key.clone()))
            }
        };
        metrics::histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1_000.0);
        retry::handle_result(&self.queue, self.sink.as_ref(), &key, result);
        true
    }

    pub async fn run(&self) {
        while self.process_next_item().await {}
    }
}

/// Keep one worker loop alive until the queue shuts down, restarting it after
/// a panic outside the sync itself (retry bookkeeping or the error sink).
pub async fn supervise(worker: Arc<Worker>, id: usize, token: CancellationToken) {
    loop {
        let w = Arc::clone(&worker);
        match tokio::spawn(async move { w.run().await }).await {
            Ok(()) => {
                debug!(worker = id, "worker stopped");
                return;
            }
            Err(e) if e.is_panic() => {
                error!(worker = id, "worker panicked; restarting");
            }
            Err(e) => {
                debug!(worker = id, error = %e, "worker task cancelled");
                return;
            }
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(WORKER_RESTART_DELAY) => {}
        }
    }
}
