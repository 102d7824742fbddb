use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use recertify_controller::{Controller, ControllerOptions};
use recertify_core::Policy;
use recertify_ops::KubeOps;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "recertify", version, about = "Delete cert-manager Certificates stuck on a known failure so they are re-issued")]
struct Cli {
    /// Path to a kubeconfig file (default: KUBECONFIG, ~/.kube/config, then in-cluster)
    #[arg(long = "kubeconfig")]
    kubeconfig: Option<PathBuf>,

    /// Substring of a condition message that makes a failing Certificate eligible for deletion
    #[arg(long = "trigger", default_value = "", env = "RECERTIFY_TRIGGER")]
    trigger: String,

    /// Log what would be deleted without deleting
    #[arg(long = "dryrun", action = ArgAction::SetTrue, env = "RECERTIFY_DRYRUN")]
    dry_run: bool,

    /// Log level filter; RECERTIFY_LOG takes precedence
    #[arg(long = "log-level", default_value = "debug")]
    log_level: String,

    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Json, env = "RECERTIFY_LOG_FORMAT")]
    log_format: LogFormat,

    /// Only watch this namespace (default: all namespaces)
    #[arg(long = "namespace", env = "RECERTIFY_NAMESPACE")]
    namespace: Option<String>,

    /// Concurrent worker loops
    #[arg(long = "workers", default_value_t = 1, env = "RECERTIFY_WORKERS")]
    workers: usize,

    /// Bound the startup cache sync wait; 0 waits until shutdown
    #[arg(long = "cache-sync-timeout-secs", default_value_t = 0, env = "RECERTIFY_CACHE_SYNC_TIMEOUT_SECS")]
    cache_sync_timeout_secs: u64,

    /// Re-deliver every cached Certificate on this period; 0 disables
    #[arg(long = "resync-secs", default_value_t = 600, env = "RECERTIFY_RESYNC_SECS")]
    resync_secs: u64,

    /// Also reconcile on updates, not only on additions
    #[arg(long = "watch-updates", action = ArgAction::SetTrue, env = "RECERTIFY_WATCH_UPDATES")]
    watch_updates: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

fn init_tracing(level: &str, format: LogFormat) {
    let env = std::env::var("RECERTIFY_LOG").unwrap_or_else(|_| level.to_string());
    let (filter, bad) = match tracing_subscriber::EnvFilter::from_str(&env) {
        Ok(f) => (f, None),
        Err(e) => (tracing_subscriber::EnvFilter::new("info"), Some(e)),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    if let Some(e) = bad {
        error!(filter = %env, error = %e, "invalid log filter; using info");
    }
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RECERTIFY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid RECERTIFY_METRICS_ADDR; expected host:port");
        }
    }
}

fn queue_cap() -> usize {
    std::env::var("RECERTIFY_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(2048)
}

fn secs(n: u64) -> Option<Duration> {
    (n > 0).then(|| Duration::from_secs(n))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Ctrl-C received; shutting down"),
                    _ = term.recv() => info!("SIGTERM received; shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM; only Ctrl-C stops the controller"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received; shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);
    init_metrics();

    let client = recertify_kubehub::client(cli.kubeconfig.as_deref())
        .await
        .context("building kubernetes client")?;

    let (watch_tx, cache) = recertify_store::spawn_ingest(queue_cap(), secs(cli.resync_secs));
    let watch_client = client.clone();
    let namespace = cli.namespace.clone();
    let watcher = tokio::spawn(async move {
        if let Err(e) = recertify_kubehub::start_watcher(watch_client, namespace.as_deref(), watch_tx).await {
            error!(error = %e, "certificate watcher stopped");
        }
    });

    let options = ControllerOptions {
        workers: cli.workers.max(1),
        cache_sync_timeout: secs(cli.cache_sync_timeout_secs),
        watch_updates: cli.watch_updates,
    };
    let controller = Controller::new(
        Policy::new(cli.trigger, cli.dry_run),
        Arc::new(cache),
        Arc::new(KubeOps::new(client)),
    )
    .with_options(options);

    let token = CancellationToken::new();
    let stop = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stop.cancel();
    });

    controller.run(token).await;
    watcher.abort();
    info!("bye");
    Ok(())
}
