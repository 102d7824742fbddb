//! recertify store: the local watch mirror.
//!
//! An ingest task consumes [`WatchEvent`]s from the watcher, applies them to a
//! [`Mirror`], publishes an immutable [`CacheSnapshot`] through `ArcSwap`, and
//! then notifies subscribers. Readers never block the ingest task.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use recertify_core::{CacheEvent, CachedObject, CertificateSnapshot, ResourceKey, WatchEvent};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("decoding cached object {key}: {source}")]
    Decode {
        key: ResourceKey,
        #[source]
        source: serde_json::Error,
    },
}

/// Immutable view of the cache at one epoch.
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    pub items: FxHashMap<ResourceKey, Arc<CachedObject>>,
}

/// Mutable mirror owned by the ingest task. Turns watch events into cache
/// notifications with informer semantics (add vs update vs delete).
#[derive(Debug, Default)]
pub struct Mirror {
    epoch: u64,
    items: FxHashMap<ResourceKey, Arc<CachedObject>>,
    synced: bool,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True once the first full list has been applied.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Apply a batch of watch events and append the resulting notifications to `out`.
    pub fn apply_batch(&mut self, batch: Vec<WatchEvent>, out: &mut Vec<CacheEvent>) {
        for ev in batch {
            match ev {
                WatchEvent::Delta(d) => match d.kind {
                    recertify_core::DeltaKind::Applied => {
                        let new = Arc::new(CachedObject::from(d));
                        match self.items.insert(new.key.clone(), Arc::clone(&new)) {
                            Some(old) => out.push(CacheEvent::Updated { old, new }),
                            None => out.push(CacheEvent::Added(new)),
                        }
                    }
                    recertify_core::DeltaKind::Deleted => {
                        if let Some(old) = self.items.remove(&d.key) {
                            out.push(CacheEvent::Deleted(old));
                        }
                    }
                },
                WatchEvent::Relisted(list) => self.replace(list, out),
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    fn replace(&mut self, list: Vec<recertify_core::Delta>, out: &mut Vec<CacheEvent>) {
        let mut next: FxHashMap<ResourceKey, Arc<CachedObject>> = FxHashMap::default();
        for d in list {
            let new = Arc::new(CachedObject::from(d));
            let old = next.get(&new.key).cloned().or_else(|| self.items.remove(&new.key));
            match old {
                Some(old) => out.push(CacheEvent::Updated { old, new: Arc::clone(&new) }),
                None => out.push(CacheEvent::Added(Arc::clone(&new))),
            }
            next.insert(new.key.clone(), new);
        }
        for (_, gone) in self.items.drain() {
            out.push(CacheEvent::Deleted(gone));
        }
        self.items = next;
        self.synced = true;
    }

    /// Re-deliver every object as an update with `old == new`.
    pub fn resync(&self, out: &mut Vec<CacheEvent>) {
        out.extend(
            self.items
                .values()
                .map(|o| CacheEvent::Updated { old: Arc::clone(o), new: Arc::clone(o) }),
        );
    }

    pub fn freeze(&self) -> Arc<CacheSnapshot> {
        Arc::new(CacheSnapshot { epoch: self.epoch, items: self.items.clone() })
    }
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<CacheEvent>>>>;

/// Read handle onto the cache. Cheap to clone.
#[derive(Clone)]
pub struct CacheHandle {
    snap: Arc<ArcSwap<CacheSnapshot>>,
    synced_rx: watch::Receiver<bool>,
    subscribers: Subscribers,
}

impl CacheHandle {
    pub fn len(&self) -> usize {
        self.snap.load().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up one object. `Ok(None)` means the cache does not hold it.
    pub fn get(&self, key: &ResourceKey) -> Result<Option<CertificateSnapshot>, LookupError> {
        let snap = self.snap.load();
        match snap.items.get(key) {
            Some(obj) => obj
                .snapshot()
                .map(Some)
                .map_err(|source| LookupError::Decode { key: key.clone(), source }),
            None => Ok(None),
        }
    }

    pub fn has_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced_rx.clone()
    }

    /// Register for change notifications. Objects already cached are replayed
    /// as `Added` before any later change, so no object is missed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CacheEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.lock().unwrap();
        for obj in self.snap.load().items.values() {
            let _ = tx.send(CacheEvent::Added(Arc::clone(obj)));
        }
        subs.push(tx);
        rx
    }
}

fn dispatch(subscribers: &Subscribers, snap: Option<(&ArcSwap<CacheSnapshot>, Arc<CacheSnapshot>)>, events: Vec<CacheEvent>) {
    let mut subs = subscribers.lock().unwrap();
    if let Some((cell, next)) = snap {
        cell.store(next);
    }
    for ev in events {
        metrics::counter!("cache_events_total", 1u64, "kind" => ev.kind());
        subs.retain(|tx| tx.send(ev.clone()).is_ok());
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Spawn the ingest loop. Returns the sender the watcher feeds and a read handle.
///
/// `resync` re-delivers every cached object to subscribers on that period once
/// the cache has synced.
pub fn spawn_ingest(cap: usize, resync: Option<Duration>) -> (mpsc::Sender<WatchEvent>, CacheHandle) {
    let cap = cap.max(1);
    let (tx, mut rx) = mpsc::channel::<WatchEvent>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(CacheSnapshot::default()));
    let (synced_tx, synced_rx) = watch::channel(false);
    let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));

    let snap_clone = Arc::clone(&snap);
    let subs_clone = Arc::clone(&subscribers);
    let mut resync_tick = resync.filter(|d| !d.is_zero()).map(|d| {
        let mut i = tokio::time::interval_at(Instant::now() + d, d);
        i.set_missed_tick_behavior(MissedTickBehavior::Delay);
        i
    });

    tokio::spawn(async move {
        let mut mirror = Mirror::new();
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(first) = maybe else {
                        debug!("watch channel closed; exiting ingest loop");
                        break;
                    };
                    let mut batch = vec![first];
                    while batch.len() < cap {
                        match rx.try_recv() {
                            Ok(ev) => batch.push(ev),
                            Err(_) => break,
                        }
                    }
                    let was_synced = mirror.is_synced();
                    let mut events = Vec::new();
                    mirror.apply_batch(batch, &mut events);
                    dispatch(&subs_clone, Some((&*snap_clone, mirror.freeze())), events);
                    metrics::gauge!("cache_objects", mirror.len() as f64);
                    if !was_synced && mirror.is_synced() {
                        info!(objects = mirror.len(), "cache synced");
                        let _ = synced_tx.send(true);
                    }
                }
                _ = tick(&mut resync_tick) => {
                    if mirror.is_synced() {
                        let mut events = Vec::with_capacity(mirror.len());
                        mirror.resync(&mut events);
                        debug!(objects = events.len(), "periodic resync");
                        dispatch(&subs_clone, None, events);
                    }
                }
            }
        }
        // closing the notification channels lets subscribers observe the end of the feed
        subs_clone.lock().unwrap().clear();
        info!("ingest loop stopped");
    });

    (tx, CacheHandle { snap, synced_rx, subscribers })
}
