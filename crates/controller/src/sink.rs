use recertify_core::ResourceKey;
use tracing::error;

use crate::reconcile::SyncError;

/// Out-of-band destination for keys the controller gave up on after the
/// retry ceiling, including keys whose attempts kept panicking.
pub trait ErrorSink: Send + Sync {
    fn report(&self, key: &ResourceKey, err: &SyncError);
}

/// Logs the drop at error level and counts it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, key: &ResourceKey, err: &SyncError) {
        metrics::counter!("reconcile_dropped_total", 1u64);
        error!(ns = %key.namespace, name = %key.name, error = %err, "giving up on certificate after repeated failures");
    }
}
