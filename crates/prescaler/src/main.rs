//! Event Prescaler - raises cluster capacity ahead of scheduled traffic events
//!
//! This binary polls the event store, prescales autoscalers and node pools
//! for events about to start, and watches them until they end.

use anyhow::Result;
use event_prescaler::{api, config::PrescalerConfig};
use prescaler_lib::{
    cluster::AutoscalerCache,
    credentials::CredentialStore,
    fleet::FleetProvisioner,
    observability::{PrescalerMetrics, StructuredLogger},
    scheduler::GkeConnector,
    shutdown, EventRunner, EventStore, HealthRegistry, PgEventStore, Scheduler,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const PRESCALER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting event-prescaler");

    let config = PrescalerConfig::load()?;
    info!(instance = %config.instance_name, "Prescaler configured");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    let store = PgEventStore::new(pool);
    store.migrate().await?;
    info!("Event store migrated");
    let store: Arc<dyn EventStore> = Arc::new(store);

    let health_registry = HealthRegistry::new();
    let metrics = PrescalerMetrics::new();
    let logger = StructuredLogger::new(&config.instance_name);
    logger.log_startup(PRESCALER_VERSION, config.tick_interval_secs);

    let connector = GkeConnector::new(Arc::new(CredentialStore::default()))
        .with_gke_endpoint(&config.gke_endpoint)
        .with_field_manager(&config.field_manager);

    let runner = EventRunner::new(store, Arc::new(connector))
        .with_cache(Arc::new(AutoscalerCache::new(config.autoscaler_cache_ttl())))
        .with_planner(config.planner_config())
        .with_provisioner(FleetProvisioner::new(config.provisioner_config()))
        .with_watch_interval(config.watch_interval())
        .with_logger(logger.clone());
    let scheduler = Scheduler::new(
        Arc::new(runner),
        config.scheduler_config(),
        health_registry.clone(),
    );

    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_rx.clone(),
    ));

    let scheduler_handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    health_registry.set_ready(true).await;

    let reason = shutdown_signal().await?;
    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;

    // Signal shutdown to the scheduler, in-flight runs and the API server
    let _ = shutdown_tx.send(true);

    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Scheduler task panicked");
    }
    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server error"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT received")
        }
        _ = terminate.recv() => Ok("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("SIGINT received")
}
