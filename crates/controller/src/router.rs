//! Turns cache notifications into work queue entries.

use recertify_core::{CacheEvent, CachedObject, ResourceKey};
use recertify_queue::WorkQueue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub struct EventRouter {
    queue: WorkQueue<ResourceKey>,
    watch_updates: bool,
}

impl EventRouter {
    /// With `watch_updates == false` only additions are routed, so a
    /// Certificate that turns unhealthy after it was first seen is not
    /// re-examined until it is added again after a restart. A relist does not
    /// help: objects that survive it are reported as updates.
    pub fn new(queue: WorkQueue<ResourceKey>, watch_updates: bool) -> Self {
        Self { queue, watch_updates }
    }

    pub fn on_add(&self, obj: &CachedObject) {
        debug!(key = %obj.key, "certificate added");
        self.queue.add(obj.key.clone());
    }

    pub fn on_update(&self, old: &CachedObject, new: &CachedObject) {
        if !self.watch_updates {
            return;
        }
        if old.resource_version() == new.resource_version() {
            trace!(key = %new.key, "resync");
        }
        self.queue.add(new.key.clone());
    }

    pub fn on_delete(&self, obj: &CachedObject) {
        trace!(key = %obj.key, "deletion ignored");
    }

    pub fn handle(&self, ev: CacheEvent) {
        match ev {
            CacheEvent::Added(obj) => self.on_add(&obj),
            CacheEvent::Updated { old, new } => self.on_update(&old, &new),
            CacheEvent::Deleted(obj) => self.on_delete(&obj),
        }
    }

    /// Route notifications until cancelled or the cache stops publishing.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<CacheEvent>, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => self.handle(ev),
                    None => {
                        warn!("cache notification feed closed");
                        break;
                    }
                },
            }
        }
        debug!("event router stopped");
    }
}
