//! Persistence of events, their changes and observations
//!
//! [`EventStore`] is the only persistence surface the scheduler sees.
//! [`PgEventStore`] backs it with PostgreSQL; [`MemoryEventStore`] keeps
//! everything in process for tests and local runs.

mod memory;
mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::{PgEventStore, MIGRATOR};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::cluster::AutoscalerVersion;
use crate::error::StoreError;
use crate::models::{
    AutoscalerSample, ChangeOutcome, ClusterRecord, Event, EventStatus, NodePoolSample,
    ObservationSample, ProvisionedNodePoolRecord, ScheduledAutoscalerChange,
};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// `PENDING` events starting before `now + lead` that have not ended yet
    async fn due_pending_events(&self, now: DateTime<Utc>, lead: Duration)
        -> StoreResult<Vec<Event>>;

    /// `PRESCALED` events whose end lies after `now - grace`
    async fn watchable_events(&self, now: DateTime<Utc>, grace: Duration)
        -> StoreResult<Vec<Event>>;

    /// Move every `WATCHING` event that ended before `now` to `SUCCESS`,
    /// returning the events as finalized
    async fn finish_watched_events(&self, now: DateTime<Utc>) -> StoreResult<Vec<Event>>;

    async fn update_event_status(
        &self,
        event_id: Uuid,
        status: EventStatus,
        message: &str,
    ) -> StoreResult<()>;

    /// Cluster with its owning datacenter
    async fn cluster(&self, cluster_id: Uuid) -> StoreResult<ClusterRecord>;

    async fn set_cluster_autoscaler_version(
        &self,
        cluster_id: Uuid,
        version: AutoscalerVersion,
    ) -> StoreResult<()>;

    async fn changes_for_event(&self, event_id: Uuid) -> StoreResult<Vec<ScheduledAutoscalerChange>>;

    /// Apply a batch of change outcomes atomically
    async fn record_change_outcomes(&self, outcomes: &[ChangeOutcome]) -> StoreResult<()>;

    /// Link `pools` to the event, returning one record per pool. Pools that
    /// are already linked keep their existing record.
    async fn record_provisioned_pools(
        &self,
        event_id: Uuid,
        pools: &[String],
    ) -> StoreResult<Vec<ProvisionedNodePoolRecord>>;

    async fn set_provisioned_max_nodes(&self, record_id: Uuid, max_node_count: i32)
        -> StoreResult<()>;

    async fn provisioned_pools(&self, event_id: Uuid) -> StoreResult<Vec<ProvisionedNodePoolRecord>>;

    async fn insert_node_pool_samples(&self, samples: &[NodePoolSample]) -> StoreResult<()>;

    async fn insert_autoscaler_samples(&self, samples: &[AutoscalerSample]) -> StoreResult<()>;

    /// Every observation recorded for an event, oldest first
    async fn observations(&self, event_id: Uuid) -> StoreResult<Vec<ObservationSample>>;
}
