//! The cache contract the controller consumes.

use recertify_core::{CacheEvent, CertificateSnapshot, ResourceKey};
use recertify_store::{CacheHandle, LookupError};
use tokio::sync::mpsc;

/// Read-only, eventually consistent view of the watched Certificates.
pub trait CertificateInformer: Send + Sync {
    /// `Ok(None)` when the cache does not hold `key`.
    fn get(&self, key: &ResourceKey) -> Result<Option<CertificateSnapshot>, LookupError>;

    /// True once the initial list has been mirrored.
    fn has_synced(&self) -> bool;

    /// Change notifications, starting with an `Added` for every cached object.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<CacheEvent>;
}

impl CertificateInformer for CacheHandle {
    fn get(&self, key: &ResourceKey) -> Result<Option<CertificateSnapshot>, LookupError> {
        CacheHandle::get(self, key)
    }

    fn has_synced(&self) -> bool {
        CacheHandle::has_synced(self)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<CacheEvent> {
        CacheHandle::subscribe(self)
    }
}
