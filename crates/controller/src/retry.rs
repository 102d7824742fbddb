//! What happens to a key after each reconciliation attempt.

use recertify_core::ResourceKey;
use recertify_queue::WorkQueue;
use tracing::{debug, info};

use crate::reconcile::{SyncError, SyncOutcome};
use crate::sink::ErrorSink;

/// Consecutive failed attempts tolerated before a key is dropped.
pub const MAX_REQUEUES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Success: failure history cleared, key idle until the next event.
    Forget,
    /// Failure under the ceiling: requeued with backoff.
    Requeue,
    /// Failure at the ceiling: history cleared and reported, no further retry.
    Drop,
}

pub fn decide(succeeded: bool, requeues: u32) -> RetryDecision {
    match (succeeded, requeues < MAX_REQUEUES) {
        (true, _) => RetryDecision::Forget,
        (false, true) => RetryDecision::Requeue,
        (false, false) => RetryDecision::Drop,
    }
}

/// Apply the retry policy for one attempt's result.
pub fn handle_result(
    queue: &WorkQueue<ResourceKey>,
    sink: &dyn ErrorSink,
    key: &ResourceKey,
    result: Result<SyncOutcome, SyncError>,
) -> RetryDecision {
    let requeues = queue.num_requeues(key);
    let err = match result {
        Ok(outcome) => {
            metrics::counter!("reconcile_total", 1u64, "result" => "ok");
            debug!(%key, ?outcome, "forgetting requeue history");
            queue.forget(key);
            return RetryDecision::Forget;
        }
        Err(err) => err,
    };
    metrics::counter!("reconcile_total", 1u64, "result" => "error");
    let decision = decide(false, requeues);
    if decision == RetryDecision::Requeue {
        info!(%key, requeues, error = %err, "error syncing certificate; requeueing");
        queue.add_rate_limited(key.clone());
    } else {
        queue.forget(key);
        sink.report(key, &err);
        info!(%key, requeues, error = %err, "dropping certificate out of the queue");
    }
    decision
}
