//! recertify controller: the reconciliation engine.
//!
//! cache notification -> [`EventRouter`] -> [`WorkQueue`] -> worker loop ->
//! [`Reconciler::sync`] -> retry policy. The queue guarantees a key is never
//! reconciled by two workers at once, so the reconciler needs no locking.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use recertify_core::{CacheEvent, Policy, ResourceKey};
use recertify_ops::CertificateOps;
use recertify_queue::WorkQueue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod informer;
pub mod reconcile;
pub mod retry;
pub mod router;
pub mod sink;
pub mod worker;

pub use informer::CertificateInformer;
pub use reconcile::{Reconciler, SyncError, SyncOutcome};
pub use retry::{RetryDecision, MAX_REQUEUES};
pub use router::EventRouter;
pub use sink::{ErrorSink, TracingErrorSink};
pub use worker::Worker;

pub const QUEUE_NAME: &str = "certificate-controller";

const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Concurrent worker loops.
    pub workers: usize,
    /// Upper bound for the startup cache sync wait; `None` waits until cancelled.
    pub cache_sync_timeout: Option<Duration>,
    /// Also route update notifications (and therefore periodic resyncs).
    pub watch_updates: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self { workers: 1, cache_sync_timeout: None, watch_updates: false }
    }
}

pub struct Controller {
    policy: Arc<Policy>,
    informer: Arc<dyn CertificateInformer>,
    ops: Arc<dyn CertificateOps>,
    sink: Arc<dyn ErrorSink>,
    queue: WorkQueue<ResourceKey>,
    events: mpsc::UnboundedReceiver<CacheEvent>,
    options: ControllerOptions,
}

impl Controller {
    /// Build a controller and register it for cache notifications. Events that
    /// arrive before [`run`](Self::run) are buffered.
    pub fn new(policy: Policy, informer: Arc<dyn CertificateInformer>, ops: Arc<dyn CertificateOps>) -> Self {
        let events = informer.subscribe();
        Self {
            policy: Arc::new(policy),
            informer,
            ops,
            sink: Arc::new(TracingErrorSink),
            queue: WorkQueue::new(QUEUE_NAME),
            events,
            options: ControllerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn queue(&self) -> &WorkQueue<ResourceKey> {
        &self.queue
    }

    /// Run until `token` is cancelled.
    ///
    /// Waits for the cache to sync first; if that wait ends without a sync
    /// (deadline or cancellation) processing starts anyway with a warning.
    /// On cancellation the queue shuts down and in-flight syncs finish.
    pub async fn run(self, token: CancellationToken) {
        let Controller { policy, informer, ops, sink, queue, events, options } = self;
        info!(
            trigger = %policy.trigger(),
            dry_run = policy.dry_run(),
            workers = options.workers,
            watch_updates = options.watch_updates,
            "starting certificate controller"
        );

        let router = EventRouter::new(queue.clone(), options.watch_updates);
        let router_task = tokio::spawn(router.run(events, token.clone()));

        if wait_for_cache_sync(informer.as_ref(), &token, options.cache_sync_timeout).await {
            info!("cache synced");
        } else {
            warn!("cache not synced before startup wait ended; processing against a possibly incomplete cache");
        }

        let reconciler = Reconciler::new(policy, Arc::clone(&informer), ops);
        let worker = Arc::new(Worker::new(queue.clone(), reconciler, sink));
        let handles: Vec<_> = (0..options.workers.max(1))
            .map(|id| tokio::spawn(worker::supervise(Arc::clone(&worker), id, token.clone())))
            .collect();

        token.cancelled().await;
        info!("shutting down certificate controller");
        queue.shut_down();
        for h in handles {
            let _ = h.await;
        }
        let _ = router_task.await;
        info!("certificate controller stopped");
    }
}

/// Poll `has_synced` until true, `token` is cancelled, or `timeout` elapses.
pub async fn wait_for_cache_sync(
    informer: &dyn CertificateInformer,
    token: &CancellationToken,
    timeout: Option<Duration>,
) -> bool {
    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let mut poll = tokio::time::interval(CACHE_SYNC_POLL);
    loop {
        if informer.has_synced() {
            return true;
        }
        tokio::select! {
            _ = token.cancelled() => return false,
            _ = &mut deadline => return informer.has_synced(),
            _ = poll.tick() => {}
        }
    }
}
