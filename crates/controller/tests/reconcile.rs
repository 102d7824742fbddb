mod common;

use std::sync::Arc;

use common::*;
use recertify_controller::{Reconciler, SyncError, SyncOutcome};
use recertify_core::Policy;
use recertify_ops::OpsError;
use serde_json::json;

fn reconciler(inf: &Arc<FakeInformer>, ops: &Arc<FakeOps>, trigger: &str, dry_run: bool) -> Reconciler {
    Reconciler::new(Arc::new(Policy::new(trigger, dry_run)), inf.clone(), ops.clone())
}

#[tokio::test]
async fn absent_certificate_is_success_without_delete() {
    let inf = FakeInformer::synced();
    let ops = FakeOps::new();
    let r = reconciler(&inf, &ops, TRIGGER, false);
    for _ in 0..2 {
        assert_eq!(r.sync(&key("gone")).await.unwrap(), SyncOutcome::Absent);
    }
    assert_eq!(ops.attempts(), 0);
}

#[tokio::test]
async fn matching_failure_deletes_once() {
    let inf = FakeInformer::synced();
    inf.insert(failing_cert("web"));
    let ops = FakeOps::new();
    let r = reconciler(&inf, &ops, TRIGGER, false);
    assert_eq!(r.sync(&key("web")).await.unwrap(), SyncOutcome::Deleted);
    assert_eq!(ops.deleted.lock().unwrap().as_slice(), &[key("web")]);
}

#[tokio::test]
async fn several_matching_conditions_issue_one_delete() {
    let inf = FakeInformer::synced();
    inf.insert(cert(
        "web",
        &[
            ("Ready", "False", "ACME rate limit exceeded"),
            ("Issuing", "False", "rate limit on new orders"),
            ("Ready", "Unknown", "still hitting the rate limit"),
        ],
    ));
    let ops = FakeOps::new();
    let r = reconciler(&inf, &ops, TRIGGER, false);
    assert_eq!(r.sync(&key("web")).await.unwrap(), SyncOutcome::Deleted);
    assert_eq!(ops.attempts(), 1);
}

#[tokio::test]
async fn dry_run_never_deletes() {
    let inf = FakeInformer::synced();
    inf.insert(failing_cert("web"));
    let ops = FakeOps::new();
    let r = reconciler(&inf, &ops, TRIGGER, true);
    assert_eq!(r.sync(&key("web")).await.unwrap(), SyncOutcome::DryRun);
    assert_eq!(ops.attempts(), 0);
}

#[tokio::test]
async fn non_matching_failure_is_skipped_without_error() {
    let inf = FakeInformer::synced();
    inf.insert(cert("web", &[("Ready", "False", "DNS01 challenge pending")]));
    let ops = FakeOps::new();
    let r = reconciler(&inf, &ops, TRIGGER, false);
    assert_eq!(r.sync(&key("web")).await.unwrap(), SyncOutcome::Unhealthy);
    assert_eq!(ops.attempts(), 0);
}

#[tokio::test]
async fn healthy_certificate_is_left_alone() {
    let inf = FakeInformer::synced();
    inf.insert(healthy_cert("web"));
    let ops = FakeOps::new();
    let r = reconciler(&inf, &ops, TRIGGER, false);
    assert_eq!(r.sync(&key("web")).await.unwrap(), SyncOutcome::Healthy);
    assert_eq!(ops.attempts(), 0);
}

#[tokio::test]
async fn empty_trigger_matches_nothing() {
    let inf = FakeInformer::synced();
    inf.insert(failing_cert("web"));
    let ops = FakeOps::new();
    let r = reconciler(&inf, &ops, "", false);
    assert_eq!(r.sync(&key("web")).await.unwrap(), SyncOutcome::Unhealthy);
    assert_eq!(ops.attempts(), 0);
}

#[tokio::test]
async fn missing_or_empty_conditions_fail_the_attempt() {
    let inf = FakeInformer::synced();
    inf.insert(cert("fresh", &[]));
    inf.insert(json!({"metadata": {"name": "bare", "namespace": "ns"}, "spec": {}}));
    let ops = FakeOps::new();
    let r = reconciler(&inf, &ops, TRIGGER, false);
    for name in ["fresh", "bare"] {
        let err = r.sync(&key(name)).await.unwrap_err();
        assert!(matches!(err, SyncError::NotReady(k) if k == key(name)));
    }
    assert_eq!(ops.attempts(), 0);
}

#[tokio::test]
async fn failed_delete_fails_the_attempt() {
    let inf = FakeInformer::synced();
    inf.insert(failing_cert("web"));
    let ops = FakeOps::failing(1);
    let r = reconciler(&inf, &ops, TRIGGER, false);
    let err = r.sync(&key("web")).await.unwrap_err();
    assert!(matches!(err, SyncError::Delete(OpsError::Api { .. })), "{err:?}");
    assert_eq!(ops.attempts(), 1);
    assert_eq!(ops.deletes(), 0);
}

#[tokio::test]
async fn undecodable_cache_entry_is_a_lookup_failure() {
    let inf = FakeInformer::synced();
    inf.insert(json!({"metadata": {"name": "odd", "namespace": "ns"}, "status": {"conditions": "nope"}}));
    let ops = FakeOps::new();
    let r = reconciler(&inf, &ops, TRIGGER, false);
    assert!(matches!(r.sync(&key("odd")).await, Err(SyncError::Lookup(_))));
}
