#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::core::ErrorResponse;
use recertify_controller::{CertificateInformer, ErrorSink, SyncError};
use recertify_core::{CacheEvent, CachedObject, CertificateSnapshot, ResourceKey};
use recertify_kubehub::Certificate;
use recertify_ops::{CertificateOps, DeleteOutcome, OpsError};
use recertify_store::LookupError;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Raw Certificate with the given `(type, status, message)` conditions.
pub fn cert(name: &str, conditions: &[(&str, &str, &str)]) -> Value {
    let conds: Vec<Value> = conditions
        .iter()
        .map(|(t, s, m)| json!({"type": t, "status": s, "reason": "Testing", "message": m}))
        .collect();
    json!({
        "apiVersion": "cert-manager.io/v1",
        "kind": "Certificate",
        "metadata": {"name": name, "namespace": "ns", "resourceVersion": "1"},
        "spec": {"secretName": format!("{name}-tls"), "issuerRef": {"name": "letsencrypt"}},
        "status": {"conditions": conds}
    })
}

pub fn key(name: &str) -> ResourceKey {
    ResourceKey::new("ns", name)
}

pub const TRIGGER: &str = "rate limit";

pub fn failing_cert(name: &str) -> Value {
    cert(name, &[("Ready", "False", "issuance hit the ACME rate limit; backing off")])
}

pub fn healthy_cert(name: &str) -> Value {
    cert(name, &[("Ready", "True", "certificate is up to date")])
}

#[derive(Default)]
pub struct FakeInformer {
    objects: Mutex<HashMap<ResourceKey, Arc<CachedObject>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CacheEvent>>>,
    synced: AtomicBool,
}

impl FakeInformer {
    pub fn synced() -> Arc<Self> {
        let inf = Self::default();
        inf.synced.store(true, Ordering::SeqCst);
        Arc::new(inf)
    }

    pub fn unsynced() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    /// Store `raw` and notify subscribers as an add.
    pub fn insert(&self, raw: Value) {
        let obj = Arc::new(CachedObject { key: ResourceKey::from_raw(&raw).unwrap(), raw });
        self.objects.lock().unwrap().insert(obj.key.clone(), Arc::clone(&obj));
        self.subscribers.lock().unwrap().retain(|tx| tx.send(CacheEvent::Added(Arc::clone(&obj))).is_ok());
    }

    pub fn remove(&self, key: &ResourceKey) {
        self.objects.lock().unwrap().remove(key);
    }
}

impl CertificateInformer for FakeInformer {
    fn get(&self, key: &ResourceKey) -> Result<Option<CertificateSnapshot>, LookupError> {
        match self.objects.lock().unwrap().get(key) {
            Some(obj) => obj
                .snapshot()
                .map(Some)
                .map_err(|source| LookupError::Decode { key: key.clone(), source }),
            None => Ok(None),
        }
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<CacheEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for obj in self.objects.lock().unwrap().values() {
            let _ = tx.send(CacheEvent::Added(Arc::clone(obj)));
        }
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

pub fn api_err(code: u16) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: "injected".into(),
        reason: "Testing".into(),
        code,
    })
}

/// Records delete calls. Can fail or panic a number of times first and can
/// hold each delete for a while to widen overlap windows.
#[derive(Default)]
pub struct FakeOps {
    pub attempts: AtomicU32,
    pub deleted: Mutex<Vec<ResourceKey>>,
    fail_next: AtomicU32,
    panic_next: AtomicU32,
    hold: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(times: u32) -> Arc<Self> {
        let ops = Self::default();
        ops.fail_next.store(times, Ordering::SeqCst);
        Arc::new(ops)
    }

    pub fn panicking_once() -> Arc<Self> {
        let ops = Self::default();
        ops.panic_next.store(1, Ordering::SeqCst);
        Arc::new(ops)
    }

    pub fn holding(d: Duration) -> Arc<Self> {
        let ops = Self::default();
        *ops.hold.lock().unwrap() = Some(d);
        Arc::new(ops)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deleted.lock().unwrap().len()
    }

    fn take(counter: &AtomicU32) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

#[async_trait::async_trait]
impl CertificateOps for FakeOps {
    async fn get(&self, key: &ResourceKey) -> Result<Certificate, OpsError> {
        Err(OpsError::NotFound(key.clone()))
    }

    async fn delete(&self, key: &ResourceKey) -> Result<DeleteOutcome, OpsError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.panic_next) {
            panic!("injected panic deleting {key}");
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let hold = *self.hold.lock().unwrap();
        if let Some(d) = hold {
            tokio::time::sleep(d).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if Self::take(&self.fail_next) {
            return Err(OpsError::Api { key: key.clone(), source: api_err(500) });
        }
        self.deleted.lock().unwrap().push(key.clone());
        Ok(DeleteOutcome::Deleted)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub reports: Mutex<Vec<(ResourceKey, String)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

impl ErrorSink for RecordingSink {
    fn report(&self, key: &ResourceKey, err: &SyncError) {
        self.reports.lock().unwrap().push((key.clone(), err.to_string()));
    }
}

/// Poll `cond` every 10ms until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let wait = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(limit, wait).await.is_ok()
}
