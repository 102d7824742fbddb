#![forbid(unsafe_code)]

use std::time::Duration;

use recertify_core::{CacheEvent, Delta, ResourceKey, WatchEvent};
use recertify_store::{spawn_ingest, LookupError};

fn cert(ns: &str, name: &str, conditions: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "name": name, "namespace": ns, "resourceVersion": "1" },
        "spec": { "secretName": format!("{name}-tls") },
        "status": { "conditions": conditions },
    })
}

async fn wait_synced(rx: &mut tokio::sync::watch::Receiver<bool>) {
    tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s))
        .await
        .expect("sync timeout")
        .expect("ingest alive");
}

#[tokio::test]
async fn relist_syncs_cache_and_serves_lookups() {
    let (tx, cache) = spawn_ingest(16, None);
    assert!(!cache.has_synced());

    let ok = cert("prod", "web", serde_json::json!([{"type": "Ready", "status": "True"}]));
    let broken = serde_json::json!({
        "metadata": { "name": "broken", "namespace": "prod" },
        "status": { "conditions": "not-a-list" },
    });
    let list = vec![Delta::applied(ok).expect("key"), Delta::applied(broken).expect("key")];
    tx.send(WatchEvent::Relisted(list)).await.expect("send");

    let mut synced = cache.subscribe_synced();
    wait_synced(&mut synced).await;
    assert!(cache.has_synced());
    assert_eq!(cache.len(), 2);

    let snap = cache.get(&ResourceKey::new("prod", "web")).expect("lookup").expect("present");
    assert_eq!(snap.conditions().len(), 1);
    assert!(cache.get(&ResourceKey::new("prod", "missing")).expect("lookup").is_none());
    assert!(matches!(
        cache.get(&ResourceKey::new("prod", "broken")),
        Err(LookupError::Decode { .. })
    ));
}

#[tokio::test]
async fn late_subscriber_sees_existing_objects_then_changes() {
    let (tx, cache) = spawn_ingest(16, None);
    let list = vec![Delta::applied(cert("ns", "a", serde_json::json!([]))).expect("key")];
    tx.send(WatchEvent::Relisted(list)).await.expect("send");
    let mut synced = cache.subscribe_synced();
    wait_synced(&mut synced).await;

    let mut rx = cache.subscribe();
    match rx.recv().await.expect("replayed") {
        CacheEvent::Added(o) => assert_eq!(o.key, ResourceKey::new("ns", "a")),
        other => panic!("unexpected {other:?}"),
    }

    tx.send(WatchEvent::Delta(Delta::applied(cert("ns", "b", serde_json::json!([]))).expect("key")))
        .await
        .expect("send");
    tx.send(WatchEvent::Delta(Delta::deleted(cert("ns", "a", serde_json::json!([]))).expect("key")))
        .await
        .expect("send");

    let next = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.expect("timely").expect("event");
    assert!(matches!(next, CacheEvent::Added(ref o) if o.key.name == "b"));
    let next = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.expect("timely").expect("event");
    assert!(matches!(next, CacheEvent::Deleted(ref o) if o.key.name == "a"));
}

#[tokio::test(start_paused = true)]
async fn periodic_resync_emits_updates() {
    let (tx, cache) = spawn_ingest(16, Some(Duration::from_secs(600)));
    let list = vec![Delta::applied(cert("ns", "a", serde_json::json!([]))).expect("key")];
    tx.send(WatchEvent::Relisted(list)).await.expect("send");
    let mut synced = cache.subscribe_synced();
    wait_synced(&mut synced).await;

    let mut rx = cache.subscribe();
    assert!(matches!(rx.recv().await, Some(CacheEvent::Added(_))));

    tokio::time::advance(Duration::from_secs(601)).await;
    let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.expect("resync").expect("event");
    assert!(matches!(ev, CacheEvent::Updated { .. }));
}

#[tokio::test]
async fn ingest_stops_when_watcher_goes_away() {
    let (tx, cache) = spawn_ingest(4, None);
    let mut rx = cache.subscribe();
    drop(tx);
    // the loop exits and drops every subscriber sender
    let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.expect("closed in time");
    assert!(closed.is_none());
}
