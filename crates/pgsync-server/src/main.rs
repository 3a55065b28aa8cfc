//! PostgreSQL user/role reconciliation controller entry point.
//!
//! Bootstraps the Kubernetes client, Postgres pool, and file-backed state
//! store, then runs the reconcile loop alongside an Axum `/metrics` server
//! until SIGINT/SIGTERM — same overall shape as `zvault-server::main`'s
//! background-worker-plus-HTTP-server pattern.

mod config;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use config::Config;
use pgsync_core::{MetricsSink, Reconciler};
use pgsync_db::PostgresGateway;
use pgsync_k8s::{ConfigMapSpecSource, SecretsSecretSource};
use pgsync_state::FileStateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(namespace = %config.namespace, dry_run = config.dry_run, "controller starting");

    let exit_code = run(config).await.unwrap_or_else(|err| {
        error!(error = %err, "fatal error, exiting");
        1
    });

    std::process::exit(exit_code);
}

async fn run(config: Config) -> anyhow::Result<i32> {
    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;

    let spec_source = Arc::new(ConfigMapSpecSource::new(
        client.clone(),
        &config.namespace,
        config.configmap_name.clone(),
        config.max_retries,
        config.retry_backoff_base,
        config.db_name.clone(),
    ));
    let secret_source = Arc::new(SecretsSecretSource::new(
        client,
        &config.namespace,
        config.max_retries,
        config.retry_backoff_base,
    ));

    let db = Arc::new(
        PostgresGateway::connect(
            &config.database_url(),
            config.db_pool_min_conn,
            config.db_pool_max_conn,
            config.db_user.clone(),
            config.db_name.clone(),
        )
        .await
        .context("failed to initialize database pool")?,
    );

    let state = Arc::new(FileStateStore::new(config.state_file.clone()));
    let metrics = Arc::new(MetricsSink::new());

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&spec_source),
        Arc::clone(&secret_source),
        Arc::clone(&db),
        Arc::clone(&state),
        config.dry_run,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_server = {
        let metrics = Arc::clone(&metrics);
        let bind_addr = config.metrics_bind_addr;
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = routes::router().with_state(metrics);
            let listener = match TcpListener::bind(bind_addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!(%bind_addr, error = %err, "failed to bind metrics listener");
                    return;
                }
            };
            info!(%bind_addr, "metrics endpoint listening");
            let shutdown = async move {
                let _ = rx.changed().await;
            };
            if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!(error = %err, "metrics server error");
            }
        })
    };

    let reconcile_loop = tokio::spawn(reconcile_loop(reconciler, metrics, config.sync_interval_secs, shutdown_rx));

    tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
        result = reconcile_loop => {
            let _ = shutdown_tx.send(true);
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = %err, "reconcile loop exited with a fatal error");
                    let _ = metrics_server.await;
                    return Ok(1);
                }
                Err(err) => {
                    error!(error = %err, "reconcile loop task panicked");
                    let _ = metrics_server.await;
                    return Ok(1);
                }
            }
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(10), metrics_server).await;
    info!("controller stopped");
    Ok(0)
}

/// Runs the reconcile loop until `shutdown` fires. Per-cycle errors that are
/// not cycle-fatal are already handled inside the reconciler; a cycle-fatal
/// error here is logged and the loop waits for the next tick rather than
/// exiting, since transient database or spec-source outages are expected to
/// self-heal.
async fn reconcile_loop<S, K, D, T>(
    reconciler: Arc<Reconciler<S, K, D, T>>,
    metrics: Arc<MetricsSink>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: pgsync_core::SpecSource,
    K: pgsync_core::SecretSource,
    D: pgsync_core::DbGateway,
    T: pgsync_core::StateStore,
{
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match reconciler.run_cycle(chrono::Utc::now()).await {
                    Ok((stats, users_managed, roles_managed)) => {
                        info!(
                            drift = stats.drift_count,
                            errors = stats.error_count,
                            duration_s = stats.duration_seconds(),
                            "reconciliation cycle complete"
                        );
                        metrics.record_cycle(&stats, users_managed, roles_managed);
                    }
                    Err(err) => {
                        warn!(error = %err, "reconciliation cycle aborted, will retry next tick");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("reconcile loop shutting down");
                return Ok(());
            }
        }
    }
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
