//! Watch path: sample cluster state while a prescaled event is running

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use super::EventRunner;
use crate::cluster::{AutoscalerVersion, ClusterApi, NODE_POOL_LABEL};
use crate::error::{PrescaleError, Result};
use crate::models::{
    AutoscalerSample, Event, EventStatus, NodePoolSample, ProvisionedNodePoolRecord,
    ScheduledAutoscalerChange,
};
use crate::shutdown::{self, ShutdownReceiver};

/// Everything one watch run samples against
struct WatchTargets<'a> {
    api: &'a dyn ClusterApi,
    version: AutoscalerVersion,
    pools: Vec<ProvisionedNodePoolRecord>,
    changes: Vec<ScheduledAutoscalerChange>,
}

impl EventRunner {
    /// Mark `event` as watching and sample until it ends.
    ///
    /// Returns the status the event was left in, or `None` when the run was
    /// abandoned because of shutdown. Finalization to `SUCCESS` happens
    /// separately once the end time has passed.
    pub async fn watch(&self, event: Event, mut shutdown: ShutdownReceiver) -> Option<EventStatus> {
        if shutdown::is_shutdown(&shutdown) {
            return None;
        }
        self.metrics.inc_events_started("watch");

        match self.watch_until_end(&event, &mut shutdown).await {
            Ok(()) => Some(EventStatus::Watching),
            Err(e) if e.is_cancelled() => {
                info!(
                    event_id = %event.id,
                    event_name = %event.name,
                    "Watch abandoned on shutdown"
                );
                None
            }
            Err(e) => {
                self.fail(&event, &e.to_string()).await;
                Some(EventStatus::Failed)
            }
        }
    }

    async fn watch_until_end(&self, event: &Event, shutdown: &mut ShutdownReceiver) -> Result<()> {
        self.transition(event, EventStatus::Watching, "").await?;

        let cluster = self.store.cluster(event.cluster_id).await?;
        let handles = self.connector.connect(&cluster).await?;
        let version = self
            .autoscaler_version(&cluster, handles.cluster_api.as_ref())
            .await?;
        let targets = WatchTargets {
            api: handles.cluster_api.as_ref(),
            version,
            pools: self.store.provisioned_pools(event.id).await?,
            changes: self.store.changes_for_event(event.id).await?,
        };

        let mut ticker = tokio::time::interval(self.watch_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown::signalled(shutdown) => return Err(PrescaleError::Cancelled),
            }

            if Utc::now() >= event.end_time {
                break;
            }

            tokio::join!(
                self.sample_node_pools(event, &targets),
                self.sample_autoscalers(event, &targets),
            );
        }

        debug!(event_name = %event.name, "Watch reached event end");
        Ok(())
    }

    async fn sample_node_pools(&self, event: &Event, targets: &WatchTargets<'_>) {
        if targets.pools.is_empty() {
            return;
        }

        let nodes = match targets.api.list_nodes(None, None).await {
            Ok(nodes) => nodes,
            Err(e) => {
                self.metrics.inc_sampling_errors();
                self.logger
                    .log_sampling_error(&event.name, "node_pools", &e.to_string());
                return;
            }
        };

        let mut counts: HashMap<&str, i32> = HashMap::new();
        for node in &nodes {
            if let Some(pool) = node
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(NODE_POOL_LABEL))
            {
                *counts.entry(pool.as_str()).or_default() += 1;
            }
        }

        let observed_at = Utc::now();
        let samples: Vec<NodePoolSample> = targets
            .pools
            .iter()
            .map(|record| NodePoolSample {
                provisioned_pool_id: record.id,
                observed_at,
                node_count: counts
                    .get(record.node_pool_name.as_str())
                    .copied()
                    .unwrap_or(0),
            })
            .collect();

        match self.store.insert_node_pool_samples(&samples).await {
            Ok(()) => self
                .metrics
                .add_observation_samples("node_pool", samples.len()),
            Err(e) => {
                self.metrics.inc_sampling_errors();
                self.logger
                    .log_sampling_error(&event.name, "node_pools", &e.to_string());
            }
        }
    }

    async fn sample_autoscalers(&self, event: &Event, targets: &WatchTargets<'_>) {
        let namespaces: BTreeSet<&str> = targets
            .changes
            .iter()
            .map(|c| c.namespace.as_str())
            .collect();

        let observed_at = Utc::now();
        let mut samples = Vec::new();

        // Bypasses the autoscaler list cache
        for namespace in namespaces {
            let objects = match targets.api.list_autoscalers(namespace, targets.version).await {
                Ok(objects) => objects,
                Err(e) => {
                    self.metrics.inc_sampling_errors();
                    self.logger
                        .log_sampling_error(&event.name, namespace, &e.to_string());
                    continue;
                }
            };

            for change in targets.changes.iter().filter(|c| c.namespace == namespace) {
                if let Some(snapshot) = objects
                    .iter()
                    .map(|o| o.snapshot())
                    .find(|s| change.targets(&s.namespace, &s.name))
                {
                    samples.push(AutoscalerSample {
                        change_id: change.id,
                        observed_at,
                        current_replicas: snapshot.current_replicas,
                        desired_replicas: snapshot.desired_replicas,
                    });
                }
            }
        }

        if samples.is_empty() {
            return;
        }

        match self.store.insert_autoscaler_samples(&samples).await {
            Ok(()) => self
                .metrics
                .add_observation_samples("autoscaler", samples.len()),
            Err(e) => {
                self.metrics.inc_sampling_errors();
                self.logger
                    .log_sampling_error(&event.name, "autoscalers", &e.to_string());
            }
        }
    }
}
