//! clusterpool pool manager
//!
//! Binds `ClusterRequest` objects to ready clusters and recycles them when
//! the request goes away.
//!
//! ## Architecture
//!
//! - **Controller**: watches requests and instances, retries failed keys
//! - **Policy**: on-demand provisioning or fixed-size warm pools
//! - **Maintenance Loop**: keeps warm pools topped up
//! - **Provider**: abstracts cluster lifecycle (mock for now)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clusterpool_manager::{
    policy, registry, ClusterInstance, ClusterManager, ClusterRequest, Config, InstanceReconciler,
    MockProvider, PoolHandler, RequestReconciler,
};
use clusterpool_reconcile::{Controller, MemoryStore, ResourceStore, Selector};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Upper bound on waiting for the controller to drain on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so the log level applies
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        namespace = %config.namespace,
        mode = %config.pool.mode,
        pool_size = config.pool.pool_size,
        life_span_secs = config.pool.life_span.as_secs(),
        workers = config.workers,
        "Starting clusterpool pool manager"
    );

    // In-process stores and provider (mock for now)
    let registry = registry();
    let requests: Arc<dyn ResourceStore<ClusterRequest>> =
        Arc::new(MemoryStore::<ClusterRequest>::new(&registry)?);
    let instances: Arc<dyn ResourceStore<ClusterInstance>> =
        Arc::new(MemoryStore::<ClusterInstance>::new(&registry)?);
    let provider = Arc::new(MockProvider::new());

    let manager = Arc::new(ClusterManager::new(
        config.namespace.clone(),
        provider,
        Arc::clone(&instances),
        config.pool.clone(),
    ));
    let policy = policy::from_config(manager, &config.pool);

    policy.restore().await.context("restoring instances")?;
    if let Err(e) = policy.maintain().await {
        warn!(error = %e, "Initial pool maintenance failed");
    }

    // Requests deleted while we were down never produce a delete event
    let handler = Arc::new(PoolHandler::new(Arc::clone(&policy), Arc::clone(&requests)));
    match handler.release_orphans().await {
        Ok(released) => info!(released, "Released clusters of vanished requests"),
        Err(e) => warn!(error = %e, "Failed to release clusters of vanished requests"),
    }

    // Wire the controller
    let mut controller = Controller::new(config.controller_config());
    controller.watch(
        requests,
        Selector::namespaced(config.namespace.clone()),
        Arc::new(RequestReconciler::new(handler)),
    )?;
    controller.watch(
        instances,
        Selector::namespaced(config.namespace.clone()),
        Arc::new(InstanceReconciler::new(Arc::clone(&policy))),
    )?;
    let controller = Arc::new(controller);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut controller_handle = tokio::spawn(Arc::clone(&controller).run(shutdown_rx.clone()));

    // Start the maintenance loop
    let maintain_handle = config.maintain_interval().map(|period| {
        let policy = Arc::clone(&policy);
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = policy.maintain().await {
                            warn!(error = %e, "Pool maintenance failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Maintenance loop shutting down");
                            break;
                        }
                    }
                }
            }
        })
    });

    // Wait for shutdown signal
    let mut controller_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            controller_done = true;
            match result {
                Ok(Ok(())) => info!("Controller exited"),
                Ok(Err(e)) => error!(error = %e, "Controller failed"),
                Err(e) => error!(error = %e, "Controller task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if !controller_done {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, controller_handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "Controller failed during shutdown"),
            Ok(Err(e)) => error!(error = %e, "Controller task panicked"),
            Err(_) => warn!("Controller did not stop in time"),
        }
    }
    if let Some(handle) = maintain_handle {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
            warn!("Maintenance loop did not stop in time");
        }
    }

    info!("Pool manager shutdown complete");
    Ok(())
}
