//! recertify kubehub: client construction and list+watch wiring for Certificates

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use recertify_core::{Delta, DeltaKind, ResourceKey, WatchEvent};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod certificate;

pub use certificate::{Certificate, CertificateCondition, CertificateSpec, CertificateStatus, IssuerRef};

/// Build a client from an explicit kubeconfig path, or fall back to the
/// default inference (in-cluster env, then `$KUBECONFIG`/`~/.kube/config`).
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?;
            Client::try_from(cfg).context("building kube client")
        }
        None => Client::try_default().await.context("inferring kube client config"),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn delta_from<K: Serialize>(obj: &K, kind: DeltaKind) -> Result<Delta> {
    let mut raw = serde_json::to_value(obj).context("serializing watched object")?;
    strip_managed_fields(&mut raw);
    let key = ResourceKey::from_raw(&raw)?;
    Ok(Delta { key, kind, raw })
}

fn watch_event_from<K: Serialize>(ev: Event<K>) -> Result<WatchEvent> {
    Ok(match ev {
        Event::Applied(o) => WatchEvent::Delta(delta_from(&o, DeltaKind::Applied)?),
        Event::Deleted(o) => WatchEvent::Delta(delta_from(&o, DeltaKind::Deleted)?),
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            let deltas = list.iter().map(|o| delta_from(o, DeltaKind::Applied)).collect::<Result<Vec<_>>>()?;
            WatchEvent::Relisted(deltas)
        }
    })
}

/// List+watch Certificates (optionally in one namespace) and forward every
/// change into `tx`. Watch errors are retried with the default backoff; the
/// loop ends when the stream ends or the receiving cache goes away.
pub async fn start_watcher(client: Client, namespace: Option<&str>, tx: mpsc::Sender<WatchEvent>) -> Result<()> {
    let api: Api<Certificate> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "certificate watcher started");
    while let Some(ev) = stream.next().await {
        let ev = match ev {
            Ok(ev) => ev,
            Err(e) => {
                metrics::counter!("watch_errors_total", 1u64);
                warn!(error = %e, "watch error; backing off");
                continue;
            }
        };
        let msg = match watch_event_from(ev) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = ?e, "skipping undecodable watch event");
                continue;
            }
        };
        if tx.send(msg).await.is_err() {
            debug!("cache ingest closed; stopping watcher");
            return Ok(());
        }
    }
    warn!("watcher stream ended");
    Ok(())
}
