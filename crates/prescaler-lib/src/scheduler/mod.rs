//! Event scheduling
//!
//! This module provides:
//! - [`EventRunner`], which owns one event at a time through its execute
//!   path (`PENDING` to `PRESCALED` or `FAILED`) or its watch path
//!   (`PRESCALED` to `WATCHING`, sampling until the event ends)
//! - [`Scheduler`], the periodic driver that finds due events and spawns a
//!   run for each
//! - [`ClusterConnector`], the factory for per-cluster clients

mod connector;
mod driver;
mod executor;
mod watcher;


pub use connector::{ClusterConnector, ClusterHandles, GkeConnector};
pub use driver::{Scheduler, SchedulerConfig};

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::cluster::{AutoscalerCache, AutoscalerVersion, ClusterApi};
use crate::error::Result;
use crate::fleet::FleetProvisioner;
use crate::models::{ClusterRecord, Event, EventStatus};
use crate::observability::{PrescalerMetrics, StructuredLogger};
use crate::planner::PlannerConfig;
use crate::store::EventStore;

/// Default delay between two watch samples
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(30);

/// Runs the execute and watch paths of individual events
pub struct EventRunner {
    store: Arc<dyn EventStore>,
    connector: Arc<dyn ClusterConnector>,
    cache: Arc<AutoscalerCache>,
    planner: PlannerConfig,
    provisioner: FleetProvisioner,
    watch_interval: Duration,
    metrics: PrescalerMetrics,
    logger: StructuredLogger,
}

impl EventRunner {
    pub fn new(store: Arc<dyn EventStore>, connector: Arc<dyn ClusterConnector>) -> Self {
        Self {
            store,
            connector,
            cache: Arc::new(AutoscalerCache::default()),
            planner: PlannerConfig::default(),
            provisioner: FleetProvisioner::default(),
            watch_interval: DEFAULT_WATCH_INTERVAL,
            metrics: PrescalerMetrics::new(),
            logger: StructuredLogger::new("event-prescaler"),
        }
    }

    pub fn with_cache(mut self, cache: Arc<AutoscalerCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_planner(mut self, planner: PlannerConfig) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_provisioner(mut self, provisioner: FleetProvisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<AutoscalerCache> {
        &self.cache
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    async fn transition(&self, event: &Event, status: EventStatus, message: &str) -> Result<()> {
        self.store
            .update_event_status(event.id, status, message)
            .await?;
        self.metrics.inc_event_transition(status.as_str());
        self.logger
            .log_status_transition(&event.name, status.as_str(), message);
        Ok(())
    }

    /// Record a terminal failure, logging when even that cannot be persisted
    async fn fail(&self, event: &Event, message: &str) {
        if let Err(e) = self.transition(event, EventStatus::Failed, message).await {
            error!(
                event_id = %event.id,
                event_name = %event.name,
                error = %e,
                "Failed to persist event failure"
            );
        }
    }

    /// Autoscaler version of `cluster`, discovering and caching it when the
    /// stored one is missing
    async fn autoscaler_version(
        &self,
        cluster: &ClusterRecord,
        api: &dyn ClusterApi,
    ) -> Result<AutoscalerVersion> {
        if let Some(version) = cluster.autoscaler_version {
            return Ok(version);
        }

        let version: AutoscalerVersion = api.preferred_autoscaler_version().await?.parse()?;
        self.store
            .set_cluster_autoscaler_version(cluster.id, version)
            .await?;
        info!(
            cluster = %cluster.name,
            version = %version,
            "Discovered autoscaler api version"
        );
        Ok(version)
    }
}
