//! Periodic driver
//!
//! Every tick runs three independent queries: due pending events are
//! executed, prescaled events are watched and ended watches are finalized.
//! Each selected event gets its own task; a tick never waits for them.
//! An event keeps a single run until that run exits, even while the run is
//! still waiting for a concurrency permit.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::EventRunner;
use crate::health::{components, HealthRegistry};
use crate::models::{Event, EventStatus};
use crate::observability::PrescalerMetrics;
use crate::shutdown::{self, ShutdownReceiver};

/// Driver timing
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// How far ahead of its start a pending event is executed
    pub execute_lead: Duration,
    /// How long after its end a prescaled event is still picked up for watching
    pub watch_grace: Duration,
    /// Upper bound on concurrently running event tasks, `None` for unbounded
    pub max_concurrent_events: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            execute_lead: Duration::from_secs(60),
            watch_grace: Duration::from_secs(300),
            max_concurrent_events: None,
        }
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[derive(Clone, Copy)]
enum RunPath {
    Execute,
    Watch,
}

/// Releases an event's in-flight claim when its run ends, however it ends
struct InFlightClaim {
    runs: Arc<DashMap<Uuid, ()>>,
    event_id: Uuid,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.runs.remove(&self.event_id);
    }
}

/// Finds due events on a fixed tick and spawns a run for each
pub struct Scheduler {
    runner: Arc<EventRunner>,
    config: SchedulerConfig,
    health: HealthRegistry,
    limiter: Option<Arc<Semaphore>>,
    in_flight: Arc<DashMap<Uuid, ()>>,
    metrics: PrescalerMetrics,
}

impl Scheduler {
    pub fn new(runner: Arc<EventRunner>, config: SchedulerConfig, health: HealthRegistry) -> Self {
        let limiter = config
            .max_concurrent_events
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            runner,
            config,
            health,
            limiter,
            in_flight: Arc::new(DashMap::new()),
            metrics: PrescalerMetrics::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Number of events that currently own a run
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Tick until shutdown is signalled
    pub async fn run(&self, mut shutdown: ShutdownReceiver) {
        self.health.register(components::DRIVER).await;
        self.health.register(components::STORE).await;

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(&shutdown).await;
                }
                _ = shutdown::signalled(&mut shutdown) => {
                    info!("Scheduler stopping");
                    break;
                }
            }
        }

        self.health
            .set_unhealthy(components::DRIVER, "Scheduler stopped")
            .await;
    }

    /// Run the three queries once, returning the handles of spawned runs
    pub async fn tick(&self, shutdown: &ShutdownReceiver) -> Vec<JoinHandle<Option<EventStatus>>> {
        let now = Utc::now();
        let store = self.runner.store().clone();
        let mut handles = Vec::new();
        let mut store_error = None;

        let purged = self.runner.cache().purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired autoscaler listings");
        }

        match store
            .due_pending_events(now, chrono_duration(self.config.execute_lead))
            .await
        {
            Ok(events) => {
                for event in events {
                    handles.extend(self.spawn(RunPath::Execute, event, shutdown.clone()));
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to query pending events");
                store_error = Some(e.to_string());
            }
        }

        match store
            .watchable_events(now, chrono_duration(self.config.watch_grace))
            .await
        {
            Ok(events) => {
                for event in events {
                    handles.extend(self.spawn(RunPath::Watch, event, shutdown.clone()));
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to query prescaled events");
                store_error = Some(e.to_string());
            }
        }

        match store.finish_watched_events(now).await {
            Ok(finished) => {
                for event in &finished {
                    self.metrics
                        .inc_event_transition(EventStatus::Success.as_str());
                    self.runner.logger().log_status_transition(
                        &event.name,
                        EventStatus::Success.as_str(),
                        &event.message,
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to finalize watched events");
                store_error = Some(e.to_string());
            }
        }

        match store_error {
            Some(message) => self.health.set_degraded(components::STORE, message).await,
            None => self.health.set_healthy(components::STORE).await,
        }
        self.health.set_healthy(components::DRIVER).await;

        if !handles.is_empty() {
            debug!(spawned = handles.len(), "Scheduler tick spawned event runs");
        }
        handles
    }

    /// Spawn a run for `event` unless one already owns it
    fn spawn(
        &self,
        path: RunPath,
        event: Event,
        shutdown: ShutdownReceiver,
    ) -> Option<JoinHandle<Option<EventStatus>>> {
        if self.in_flight.insert(event.id, ()).is_some() {
            debug!(
                event_id = %event.id,
                event_name = %event.name,
                "Event already has a run in flight, skipping"
            );
            return None;
        }
        let claim = InFlightClaim {
            runs: self.in_flight.clone(),
            event_id: event.id,
        };

        let runner = self.runner.clone();
        let limiter = self.limiter.clone();

        Some(tokio::spawn(async move {
            let _claim = claim;
            // Held for the whole run
            let _permit = match limiter {
                Some(limiter) => match limiter.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return None,
                },
                None => None,
            };

            match path {
                RunPath::Execute => runner.execute(event, shutdown).await,
                RunPath::Watch => runner.watch(event, shutdown).await,
            }
        }))
    }
}
