//! Runner Fleet Manager
//!
//! Keeps a pool of ephemeral single-use CI runner VMs at the configured size
//! and, in reactive mode, spawns runners for queued jobs.
//!
//! ## Architecture
//!
//! - **Pass Controller**: Runs reconciliation passes on a timer, on fleet
//!   config reloads (SIGHUP) and on API request
//! - **Reconciler**: Diffs desired fleet shape against backend and platform
//!   state and creates or deletes runners
//! - **Reactive Consumer**: Spawns runners for queued job requests under the
//!   same global cap
//! - **Admin API**: Health, status, runner check and flush endpoints

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_manager::{
    api::{self, AppState},
    backend::{Backend, CloudBackend, LocalBackend, MockBackend},
    capacity::{CapacityGate, FleetLedger},
    config::{Config, FleetConfig},
    controller::PassController,
    health::HealthMonitor,
    metrics::{FsExchange, JsonLinesSink, MetricsAggregator},
    platform::{HttpPlatform, PlatformPath},
    provision::Provisioner,
    reactive::{BackoffPolicy, NatsQueue, NatsQueueConfig, ReactiveConsumer},
    reconciler::{Reconciler, ReconcilerSettings},
    types::{BackendKind, FleetTarget},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting runner fleet manager");

    let fleet = FleetConfig::load(&config.fleet_file)?;
    info!(
        fleet_file = %config.fleet_file,
        specs = fleet.specs.len(),
        global_cap = fleet.global_cap,
        reactive = fleet.reactive.enabled,
        "Fleet configuration loaded"
    );

    let backends = build_backends(&config, &fleet)?;
    let path = PlatformPath::parse(&config.platform_path, config.runner_group_id)
        .map_err(anyhow::Error::msg)?;
    let platform = Arc::new(
        HttpPlatform::new(&config.platform_url, &config.platform_token, path)
            .context("failed to build CI platform client")?,
    );

    let target = fleet.target();
    let mut ledger = FleetLedger::new(
        fleet.quarantine.threshold,
        fleet.quarantine_window(),
        fleet.dedup_retention(),
    );
    ledger.set_cap(target.global_cap);
    let gate = Arc::new(CapacityGate::new(ledger));
    let provisioner = Arc::new(Provisioner::new(backends, platform, gate));

    let metrics = Arc::new(MetricsAggregator::new(
        Arc::new(FsExchange::new(&config.exchange_dir)),
        Arc::new(JsonLinesSink::new(&config.metrics_log)),
    ));
    let reconciler = Reconciler::new(
        provisioner.clone(),
        HealthMonitor::new(fleet.health_timeout(), fleet.orphan_grace()),
        metrics,
        ReconcilerSettings::from_config(&fleet),
    );

    let (target_tx, target_rx) = watch::channel(target);
    let controller = PassController::new(reconciler, target_rx.clone());

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller_handle = tokio::spawn({
        let controller = controller.clone();
        let shutdown_rx = shutdown_rx.clone();
        let interval = fleet.reconcile_interval();
        async move {
            controller.run(interval, shutdown_rx).await;
        }
    });

    let consumer_handle = match (&config.queue_url, fleet.reactive.enabled) {
        (Some(url), true) => {
            let queue_config = NatsQueueConfig {
                url: url.clone(),
                stream: config.queue_stream.clone(),
                subject: config.queue_subject.clone(),
                consumer: config.queue_consumer.clone(),
                ack_wait: Duration::from_secs(300),
                fetch_wait: Duration::from_secs(5),
            };
            let settings = fleet.reactive.clone();
            let provisioner = provisioner.clone();
            let target_rx = target_rx.clone();
            let passes = controller.subscribe();
            let mut shutdown_rx = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                let backoff = BackoffPolicy::from_settings(&settings);
                let mut attempt = 0;
                let queue = loop {
                    match NatsQueue::connect(&queue_config).await {
                        Ok(queue) => break queue,
                        Err(e) => {
                            let delay = backoff.delay(attempt);
                            attempt = attempt.saturating_add(1);
                            warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Job queue connection failed");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown_rx.changed() => return,
                            }
                        }
                    }
                };
                let consumer = ReactiveConsumer::new(Arc::new(queue), provisioner, target_rx, settings);
                consumer.run(passes, shutdown_rx).await;
            }))
        }
        (None, true) => {
            warn!("Reactive mode enabled but FLEET_QUEUE_URL is not set, consumer disabled");
            None
        }
        _ => None,
    };

    let reload_handle = tokio::spawn(watch_reloads(
        config.fleet_file.clone(),
        target_tx,
        shutdown_rx.clone(),
    ));

    let app = api::create_router(AppState::new(controller.clone()));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn({
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    loop {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                    info!("HTTP server shutting down");
                })
                .await
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(30);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, controller_handle).await {
        warn!(error = %e, "Pass controller did not shut down in time");
    }
    if let Some(handle) = consumer_handle {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Reactive consumer did not shut down in time");
        }
    }
    reload_handle.abort();

    info!("Fleet manager shutdown complete");
    Ok(())
}

/// Build a client for every backend the fleet file references.
fn build_backends(
    config: &Config,
    fleet: &FleetConfig,
) -> Result<BTreeMap<BackendKind, Arc<dyn Backend>>> {
    let mut backends: BTreeMap<BackendKind, Arc<dyn Backend>> = BTreeMap::new();
    for kind in fleet.backends() {
        let backend: Arc<dyn Backend> = match kind {
            BackendKind::Local => {
                let local = LocalBackend::new(&config.local_socket);
                if !local.socket_exists() {
                    warn!(socket = %config.local_socket, "Local virtualization socket not found");
                }
                Arc::new(local)
            }
            BackendKind::Cloud => {
                let url = config
                    .cloud_url
                    .as_deref()
                    .context("FLEET_CLOUD_URL is required for cloud runner specs")?;
                Arc::new(
                    CloudBackend::new(url, &config.cloud_token, config.cloud_network.clone())
                        .context("failed to build cloud backend client")?,
                )
            }
            BackendKind::Mock => {
                warn!("Using mock backend, runners will not be real VMs");
                Arc::new(MockBackend::new())
            }
        };
        info!(backend = %kind, "Backend configured");
        backends.insert(kind, backend);
    }
    Ok(backends)
}

/// Reload the fleet file on SIGHUP and publish the new target.
///
/// An invalid file is logged and the previous target stays in effect.
async fn watch_reloads(
    fleet_file: String,
    target_tx: watch::Sender<FleetTarget>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut hangup =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGHUP, fleet config reload disabled");
                return;
            }
        };

    loop {
        tokio::select! {
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                match FleetConfig::load(&fleet_file) {
                    Ok(fleet) => {
                        info!(specs = fleet.specs.len(), "Fleet configuration reloaded");
                        target_tx.send_replace(fleet.target());
                    }
                    Err(e) => {
                        error!(error = %format!("{e:#}"), "Fleet configuration reload failed, keeping previous");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
