//! In-process event store

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EventStore, StoreResult};
use crate::cluster::AutoscalerVersion;
use crate::error::StoreError;
use crate::models::{
    AutoscalerSample, ChangeOutcome, ClusterRecord, Event, EventStatus, NodePoolSample,
    ObservationSample, ProvisionedNodePoolRecord, ScheduledAutoscalerChange,
};

#[derive(Default)]
struct State {
    clusters: HashMap<Uuid, ClusterRecord>,
    events: Vec<Event>,
    changes: Vec<ScheduledAutoscalerChange>,
    pools: Vec<ProvisionedNodePoolRecord>,
    node_pool_samples: Vec<NodePoolSample>,
    autoscaler_samples: Vec<AutoscalerSample>,
}

impl State {
    fn event_mut(&mut self, event_id: Uuid) -> StoreResult<&mut Event> {
        self.events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| not_found("event", event_id))
    }

    fn sorted_events<F>(&self, filter: F) -> Vec<Event>
    where
        F: Fn(&Event) -> bool,
    {
        let mut events: Vec<Event> = self.events.iter().filter(|e| filter(e)).cloned().collect();
        events.sort_by_key(|e| e.start_time);
        events
    }
}

fn not_found(entity: &'static str, id: Uuid) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}

/// Event store held entirely in memory
#[derive(Default)]
pub struct MemoryEventStore {
    state: RwLock<State>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_cluster(&self, cluster: ClusterRecord) {
        self.state.write().await.clusters.insert(cluster.id, cluster);
    }

    pub async fn insert_event(&self, event: Event) {
        let mut state = self.state.write().await;
        state.events.retain(|e| e.id != event.id);
        state.events.push(event);
    }

    pub async fn insert_change(&self, change: ScheduledAutoscalerChange) {
        let mut state = self.state.write().await;
        state.changes.retain(|c| c.id != change.id);
        state.changes.push(change);
    }

    pub async fn event(&self, event_id: Uuid) -> Option<Event> {
        self.state
            .read()
            .await
            .events
            .iter()
            .find(|e| e.id == event_id)
            .cloned()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn due_pending_events(
        &self,
        now: DateTime<Utc>,
        lead: Duration,
    ) -> StoreResult<Vec<Event>> {
        let horizon = now + lead;
        Ok(self.state.read().await.sorted_events(|e| {
            e.status == EventStatus::Pending && e.start_time < horizon && e.end_time > now
        }))
    }

    async fn watchable_events(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> StoreResult<Vec<Event>> {
        let cutoff = now - grace;
        Ok(self
            .state
            .read()
            .await
            .sorted_events(|e| e.status == EventStatus::Prescaled && e.end_time > cutoff))
    }

    async fn finish_watched_events(&self, now: DateTime<Utc>) -> StoreResult<Vec<Event>> {
        let mut state = self.state.write().await;
        let mut finished = Vec::new();
        for event in state
            .events
            .iter_mut()
            .filter(|e| e.status == EventStatus::Watching && e.end_time < now)
        {
            event.status = EventStatus::Success;
            finished.push(event.clone());
        }
        Ok(finished)
    }

    async fn update_event_status(
        &self,
        event_id: Uuid,
        status: EventStatus,
        message: &str,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let event = state.event_mut(event_id)?;
        event.status = status;
        event.message = message.to_string();
        Ok(())
    }

    async fn cluster(&self, cluster_id: Uuid) -> StoreResult<ClusterRecord> {
        self.state
            .read()
            .await
            .clusters
            .get(&cluster_id)
            .cloned()
            .ok_or_else(|| not_found("cluster", cluster_id))
    }

    async fn set_cluster_autoscaler_version(
        &self,
        cluster_id: Uuid,
        version: AutoscalerVersion,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let cluster = state
            .clusters
            .get_mut(&cluster_id)
            .ok_or_else(|| not_found("cluster", cluster_id))?;
        cluster.autoscaler_version = Some(version);
        Ok(())
    }

    async fn changes_for_event(&self, event_id: Uuid) -> StoreResult<Vec<ScheduledAutoscalerChange>> {
        Ok(self
            .state
            .read()
            .await
            .changes
            .iter()
            .filter(|c| c.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn record_change_outcomes(&self, outcomes: &[ChangeOutcome]) -> StoreResult<()> {
        let mut state = self.state.write().await;

        // Validate the whole batch before touching anything
        if let Some(missing) = outcomes
            .iter()
            .find(|o| !state.changes.iter().any(|c| c.id == o.change_id))
        {
            return Err(not_found("scheduled autoscaler change", missing.change_id));
        }

        for outcome in outcomes {
            if let Some(change) = state.changes.iter_mut().find(|c| c.id == outcome.change_id) {
                change.status = outcome.status;
                change.message = outcome.message.clone();
            }
        }
        Ok(())
    }

    async fn record_provisioned_pools(
        &self,
        event_id: Uuid,
        pools: &[String],
    ) -> StoreResult<Vec<ProvisionedNodePoolRecord>> {
        let mut state = self.state.write().await;
        let mut records = Vec::with_capacity(pools.len());

        for pool in pools {
            let existing = state
                .pools
                .iter()
                .find(|r| r.event_id == event_id && &r.node_pool_name == pool)
                .cloned();
            let record = match existing {
                Some(record) => record,
                None => {
                    let record = ProvisionedNodePoolRecord {
                        id: Uuid::new_v4(),
                        event_id,
                        node_pool_name: pool.clone(),
                        max_node_count: None,
                    };
                    state.pools.push(record.clone());
                    record
                }
            };
            records.push(record);
        }

        Ok(records)
    }

    async fn set_provisioned_max_nodes(
        &self,
        record_id: Uuid,
        max_node_count: i32,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .pools
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| not_found("provisioned node pool", record_id))?;
        record.max_node_count = Some(max_node_count);
        Ok(())
    }

    async fn provisioned_pools(&self, event_id: Uuid) -> StoreResult<Vec<ProvisionedNodePoolRecord>> {
        Ok(self
            .state
            .read()
            .await
            .pools
            .iter()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn insert_node_pool_samples(&self, samples: &[NodePoolSample]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(orphan) = samples
            .iter()
            .find(|s| !state.pools.iter().any(|r| r.id == s.provisioned_pool_id))
        {
            return Err(not_found("provisioned node pool", orphan.provisioned_pool_id));
        }
        state.node_pool_samples.extend_from_slice(samples);
        Ok(())
    }

    async fn insert_autoscaler_samples(&self, samples: &[AutoscalerSample]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(orphan) = samples
            .iter()
            .find(|s| !state.changes.iter().any(|c| c.id == s.change_id))
        {
            return Err(not_found("scheduled autoscaler change", orphan.change_id));
        }
        state.autoscaler_samples.extend_from_slice(samples);
        Ok(())
    }

    async fn observations(&self, event_id: Uuid) -> StoreResult<Vec<ObservationSample>> {
        let state = self.state.read().await;
        let mut observations = Vec::new();

        for sample in &state.node_pool_samples {
            if let Some(pool) = state
                .pools
                .iter()
                .find(|r| r.id == sample.provisioned_pool_id && r.event_id == event_id)
            {
                observations.push(ObservationSample::NodePool {
                    event_id,
                    node_pool_name: pool.node_pool_name.clone(),
                    observed_at: sample.observed_at,
                    node_count: sample.node_count,
                });
            }
        }

        for sample in &state.autoscaler_samples {
            if let Some(change) = state
                .changes
                .iter()
                .find(|c| c.id == sample.change_id && c.event_id == event_id)
            {
                observations.push(ObservationSample::Autoscaler {
                    event_id,
                    namespace: change.namespace.clone(),
                    name: change.name.clone(),
                    observed_at: sample.observed_at,
                    current_replicas: sample.current_replicas,
                    desired_replicas: sample.desired_replicas,
                });
            }
        }

        observations.sort_by_key(|o| o.observed_at());
        Ok(observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeStatus;

    fn event(status: EventStatus, start: DateTime<Utc>, end: DateTime<Utc>) -> Event {
        Event {
            id: Uuid::new_v4(),
            name: format!("event-{}", status),
            start_time: start,
            end_time: end,
            cluster_id: Uuid::new_v4(),
            status,
            message: String::new(),
        }
    }

    fn change(event_id: Uuid, namespace: &str, name: &str) -> ScheduledAutoscalerChange {
        ScheduledAutoscalerChange {
            id: Uuid::new_v4(),
            event_id,
            name: name.to_string(),
            namespace: namespace.to_string(),
            min_replicas: None,
            max_replicas: 10,
            status: ChangeStatus::Scheduled,
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn test_due_pending_events_respects_lead_and_end() {
        let store = MemoryEventStore::new();
        let now = Utc::now();

        let soon = event(EventStatus::Pending, now + Duration::minutes(5), now + Duration::hours(1));
        let later = event(EventStatus::Pending, now + Duration::hours(2), now + Duration::hours(3));
        let over = event(EventStatus::Pending, now - Duration::hours(2), now - Duration::hours(1));
        let running = event(EventStatus::Executing, now, now + Duration::hours(1));
        for e in [&soon, &later, &over, &running] {
            store.insert_event(e.clone()).await;
        }

        let due = store
            .due_pending_events(now, Duration::minutes(16))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, soon.id);
    }

    #[tokio::test]
    async fn test_finish_watched_events_moves_ended_watchers_to_success() {
        let store = MemoryEventStore::new();
        let now = Utc::now();

        let ended = event(EventStatus::Watching, now - Duration::hours(2), now - Duration::minutes(1));
        let ongoing = event(EventStatus::Watching, now - Duration::hours(1), now + Duration::hours(1));
        let prescaled = event(EventStatus::Prescaled, now - Duration::hours(2), now - Duration::minutes(1));
        for e in [&ended, &ongoing, &prescaled] {
            store.insert_event(e.clone()).await;
        }

        let finished = store.finish_watched_events(now).await.unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, ended.id);

        assert_eq!(store.event(ended.id).await.unwrap().status, EventStatus::Success);
        assert_eq!(store.event(ongoing.id).await.unwrap().status, EventStatus::Watching);
        assert_eq!(store.event(prescaled.id).await.unwrap().status, EventStatus::Prescaled);

        // Already finalized events are not reported twice
        assert!(store.finish_watched_events(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watchable_events_include_grace_window() {
        let store = MemoryEventStore::new();
        let now = Utc::now();

        let just_ended = event(EventStatus::Prescaled, now - Duration::hours(1), now - Duration::minutes(2));
        let long_ended = event(EventStatus::Prescaled, now - Duration::hours(3), now - Duration::hours(2));
        store.insert_event(just_ended.clone()).await;
        store.insert_event(long_ended.clone()).await;

        let watchable = store
            .watchable_events(now, Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(watchable.len(), 1);
        assert_eq!(watchable[0].id, just_ended.id);
    }

    #[tokio::test]
    async fn test_change_outcomes_apply_atomically() {
        let store = MemoryEventStore::new();
        let event_id = Uuid::new_v4();
        let known = change(event_id, "shop", "checkout");
        store.insert_change(known.clone()).await;

        let err = store
            .record_change_outcomes(&[
                ChangeOutcome::success(known.id, ""),
                ChangeOutcome::failed(Uuid::new_v4(), "autoscaler not found"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        let changes = store.changes_for_event(event_id).await.unwrap();
        assert_eq!(changes[0].status, ChangeStatus::Scheduled);

        store
            .record_change_outcomes(&[ChangeOutcome::failed(known.id, "autoscaler not found")])
            .await
            .unwrap();
        let changes = store.changes_for_event(event_id).await.unwrap();
        assert_eq!(changes[0].status, ChangeStatus::Failed);
        assert_eq!(changes[0].message, "autoscaler not found");
    }

    #[tokio::test]
    async fn test_provisioned_pools_are_upserted() {
        let store = MemoryEventStore::new();
        let event_id = Uuid::new_v4();

        let first = store
            .record_provisioned_pools(event_id, &["p1".to_string(), "p2".to_string()])
            .await
            .unwrap();
        let second = store
            .record_provisioned_pools(event_id, &["p2".to_string()])
            .await
            .unwrap();

        assert_eq!(first[1].id, second[0].id);
        assert_eq!(store.provisioned_pools(event_id).await.unwrap().len(), 2);

        store.set_provisioned_max_nodes(first[0].id, 9).await.unwrap();
        let pools = store.provisioned_pools(event_id).await.unwrap();
        assert_eq!(pools[0].max_node_count, Some(9));
        assert_eq!(pools[1].max_node_count, None);
    }

    #[tokio::test]
    async fn test_observations_are_attributed_to_their_event() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        let event_id = Uuid::new_v4();
        let other_event = Uuid::new_v4();

        let checkout = change(event_id, "shop", "checkout");
        store.insert_change(checkout.clone()).await;
        let pools = store
            .record_provisioned_pools(event_id, &["p1".to_string()])
            .await
            .unwrap();
        let other_pools = store
            .record_provisioned_pools(other_event, &["p1".to_string()])
            .await
            .unwrap();

        store
            .insert_node_pool_samples(&[
                NodePoolSample {
                    provisioned_pool_id: pools[0].id,
                    observed_at: now + Duration::seconds(30),
                    node_count: 6,
                },
                NodePoolSample {
                    provisioned_pool_id: other_pools[0].id,
                    observed_at: now,
                    node_count: 2,
                },
            ])
            .await
            .unwrap();
        store
            .insert_autoscaler_samples(&[AutoscalerSample {
                change_id: checkout.id,
                observed_at: now,
                current_replicas: 4,
                desired_replicas: 7,
            }])
            .await
            .unwrap();

        let observations = store.observations(event_id).await.unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(
            observations[0],
            ObservationSample::Autoscaler {
                event_id,
                namespace: "shop".to_string(),
                name: "checkout".to_string(),
                observed_at: now,
                current_replicas: 4,
                desired_replicas: 7,
            }
        );
        assert!(matches!(
            observations[1],
            ObservationSample::NodePool { node_count: 6, ref node_pool_name, .. } if node_pool_name == "p1"
        ));
    }

    #[tokio::test]
    async fn test_samples_for_unknown_records_are_rejected() {
        let store = MemoryEventStore::new();
        let err = store
            .insert_node_pool_samples(&[NodePoolSample {
                provisioned_pool_id: Uuid::new_v4(),
                observed_at: Utc::now(),
                node_count: 1,
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_event_status_on_missing_event() {
        let store = MemoryEventStore::new();
        let err = store
            .update_event_status(Uuid::new_v4(), EventStatus::Failed, "boom")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "event", .. }));
    }
}
