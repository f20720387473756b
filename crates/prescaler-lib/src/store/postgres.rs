//! PostgreSQL event store
//!
//! Events are soft-deleted: every query over `events` skips rows with a
//! `deleted_at`. Timestamps are computed by the caller and bound as
//! parameters so the store never consults the database clock.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use super::{EventStore, StoreResult};
use crate::cluster::AutoscalerVersion;
use crate::error::StoreError;
use crate::models::{
    AutoscalerSample, ChangeOutcome, ClusterRecord, Datacenter, Event, EventStatus,
    NodePoolSample, ObservationSample, ProvisionedNodePoolRecord, ScheduledAutoscalerChange,
};

const EVENT_COLUMNS: &str =
    "id, name, start_time, end_time, cluster_id, status, message";

struct EventRow {
    id: Uuid,
    name: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    cluster_id: Uuid,
    status: String,
    message: String,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            cluster_id: row.try_get("cluster_id")?,
            status: row.try_get("status")?,
            message: row.try_get("message")?,
        })
    }
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Event {
            id: row.id,
            name: row.name,
            start_time: row.start_time,
            end_time: row.end_time,
            cluster_id: row.cluster_id,
            status: row.status.parse().map_err(StoreError::Decode)?,
            message: row.message,
        })
    }
}

struct ClusterRow {
    id: Uuid,
    name: String,
    certificate: String,
    server_endpoint: String,
    autoscaler_version: Option<String>,
    datacenter_id: Uuid,
    datacenter_name: String,
    datacenter_provider: String,
    datacenter_credentials: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ClusterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            certificate: row.try_get("certificate")?,
            server_endpoint: row.try_get("server_endpoint")?,
            autoscaler_version: row.try_get("autoscaler_version")?,
            datacenter_id: row.try_get("datacenter_id")?,
            datacenter_name: row.try_get("datacenter_name")?,
            datacenter_provider: row.try_get("datacenter_provider")?,
            datacenter_credentials: row.try_get("datacenter_credentials")?,
        })
    }
}

impl TryFrom<ClusterRow> for ClusterRecord {
    type Error = StoreError;

    fn try_from(row: ClusterRow) -> Result<Self, Self::Error> {
        // An unrecognized cached version is treated as not yet discovered
        let autoscaler_version = row
            .autoscaler_version
            .as_deref()
            .and_then(|v| v.parse::<AutoscalerVersion>().ok());

        Ok(ClusterRecord {
            id: row.id,
            name: row.name,
            certificate: row.certificate,
            server_endpoint: row.server_endpoint,
            datacenter: Datacenter {
                id: row.datacenter_id,
                name: row.datacenter_name,
                provider: row
                    .datacenter_provider
                    .parse()
                    .map_err(StoreError::Decode)?,
                credentials: row.datacenter_credentials,
            },
            autoscaler_version,
        })
    }
}

struct ChangeRow {
    id: Uuid,
    event_id: Uuid,
    name: String,
    namespace: String,
    min_replicas: Option<i32>,
    max_replicas: i32,
    status: String,
    message: String,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ChangeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            name: row.try_get("name")?,
            namespace: row.try_get("namespace")?,
            min_replicas: row.try_get("min_replicas")?,
            max_replicas: row.try_get("max_replicas")?,
            status: row.try_get("status")?,
            message: row.try_get("message")?,
        })
    }
}

impl TryFrom<ChangeRow> for ScheduledAutoscalerChange {
    type Error = StoreError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        Ok(ScheduledAutoscalerChange {
            id: row.id,
            event_id: row.event_id,
            name: row.name,
            namespace: row.namespace,
            min_replicas: row.min_replicas,
            max_replicas: row.max_replicas,
            status: row.status.parse().map_err(StoreError::Decode)?,
            message: row.message,
        })
    }
}

fn pool_record(row: &PgRow) -> Result<ProvisionedNodePoolRecord, sqlx::Error> {
    Ok(ProvisionedNodePoolRecord {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        node_pool_name: row.try_get("node_pool_name")?,
        max_node_count: row.try_get("max_node_count")?,
    })
}

fn into_events(rows: Vec<EventRow>) -> StoreResult<Vec<Event>> {
    rows.into_iter().map(Event::try_from).collect()
}

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Event store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn due_pending_events(
        &self,
        now: DateTime<Utc>,
        lead: Duration,
    ) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE deleted_at IS NULL
              AND status = $1
              AND start_time < $2
              AND end_time > $3
            ORDER BY start_time ASC
            "#
        ))
        .bind(EventStatus::Pending.as_str())
        .bind(now + lead)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        into_events(rows)
    }

    async fn watchable_events(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE deleted_at IS NULL
              AND status = $1
              AND end_time > $2
            ORDER BY start_time ASC
            "#
        ))
        .bind(EventStatus::Prescaled.as_str())
        .bind(now - grace)
        .fetch_all(&self.pool)
        .await?;

        into_events(rows)
    }

    async fn finish_watched_events(&self, now: DateTime<Utc>) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            UPDATE events
            SET status = $1, updated_at = now()
            WHERE deleted_at IS NULL
              AND status = $2
              AND end_time < $3
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(EventStatus::Success.as_str())
        .bind(EventStatus::Watching.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        into_events(rows)
    }

    async fn update_event_status(
        &self,
        event_id: Uuid,
        status: EventStatus,
        message: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = $2, message = $3, updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(event_id)
        .bind(status.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "event",
                id: event_id.to_string(),
            });
        }
        Ok(())
    }

    async fn cluster(&self, cluster_id: Uuid) -> StoreResult<ClusterRecord> {
        let row = sqlx::query_as::<_, ClusterRow>(
            r#"
            SELECT
                c.id,
                c.name,
                c.certificate,
                c.server_endpoint,
                c.autoscaler_version,
                d.id AS datacenter_id,
                d.name AS datacenter_name,
                d.provider AS datacenter_provider,
                d.credentials AS datacenter_credentials
            FROM clusters c
            JOIN datacenters d ON d.id = c.datacenter_id
            WHERE c.id = $1
            "#,
        )
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            entity: "cluster",
            id: cluster_id.to_string(),
        })?;

        ClusterRecord::try_from(row)
    }

    async fn set_cluster_autoscaler_version(
        &self,
        cluster_id: Uuid,
        version: AutoscalerVersion,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE clusters SET autoscaler_version = $2, updated_at = now() WHERE id = $1")
            .bind(cluster_id)
            .bind(version.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn changes_for_event(&self, event_id: Uuid) -> StoreResult<Vec<ScheduledAutoscalerChange>> {
        let rows = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT id, event_id, name, namespace, min_replicas, max_replicas, status, message
            FROM scheduled_autoscaler_changes
            WHERE event_id = $1
            ORDER BY namespace ASC, name ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(ScheduledAutoscalerChange::try_from)
            .collect()
    }

    async fn record_change_outcomes(&self, outcomes: &[ChangeOutcome]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        for outcome in outcomes {
            let result = sqlx::query(
                r#"
                UPDATE scheduled_autoscaler_changes
                SET status = $2, message = $3, updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(outcome.change_id)
            .bind(outcome.status.as_str())
            .bind(&outcome.message)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                // Dropping the transaction rolls the batch back
                return Err(StoreError::NotFound {
                    entity: "scheduled autoscaler change",
                    id: outcome.change_id.to_string(),
                });
            }
        }

        tx.commit().await?;
        debug!(count = outcomes.len(), "Recorded change outcomes");
        Ok(())
    }

    async fn record_provisioned_pools(
        &self,
        event_id: Uuid,
        pools: &[String],
    ) -> StoreResult<Vec<ProvisionedNodePoolRecord>> {
        let mut tx = self.pool.begin().await?;
        let mut records = Vec::with_capacity(pools.len());

        for pool in pools {
            let row = sqlx::query(
                r#"
                INSERT INTO provisioned_node_pools (id, event_id, node_pool_name)
                VALUES ($1, $2, $3)
                ON CONFLICT (event_id, node_pool_name)
                DO UPDATE SET node_pool_name = EXCLUDED.node_pool_name
                RETURNING id, event_id, node_pool_name, max_node_count
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(event_id)
            .bind(pool)
            .fetch_one(&mut *tx)
            .await?;
            records.push(pool_record(&row)?);
        }

        tx.commit().await?;
        Ok(records)
    }

    async fn set_provisioned_max_nodes(
        &self,
        record_id: Uuid,
        max_node_count: i32,
    ) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE provisioned_node_pools SET max_node_count = $2 WHERE id = $1")
                .bind(record_id)
                .bind(max_node_count)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "provisioned node pool",
                id: record_id.to_string(),
            });
        }
        Ok(())
    }

    async fn provisioned_pools(&self, event_id: Uuid) -> StoreResult<Vec<ProvisionedNodePoolRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, node_pool_name, max_node_count
            FROM provisioned_node_pools
            WHERE event_id = $1
            ORDER BY node_pool_name ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| pool_record(row).map_err(StoreError::from))
            .collect()
    }

    async fn insert_node_pool_samples(&self, samples: &[NodePoolSample]) -> StoreResult<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for sample in samples {
            sqlx::query(
                r#"
                INSERT INTO node_pool_samples (provisioned_node_pool_id, observed_at, node_count)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(sample.provisioned_pool_id)
            .bind(sample.observed_at)
            .bind(sample.node_count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_autoscaler_samples(&self, samples: &[AutoscalerSample]) -> StoreResult<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for sample in samples {
            sqlx::query(
                r#"
                INSERT INTO autoscaler_samples
                    (scheduled_autoscaler_change_id, observed_at, current_replicas, desired_replicas)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(sample.change_id)
            .bind(sample.observed_at)
            .bind(sample.current_replicas)
            .bind(sample.desired_replicas)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn observations(&self, event_id: Uuid) -> StoreResult<Vec<ObservationSample>> {
        let pool_rows = sqlx::query(
            r#"
            SELECT p.node_pool_name, s.observed_at, s.node_count
            FROM node_pool_samples s
            JOIN provisioned_node_pools p ON p.id = s.provisioned_node_pool_id
            WHERE p.event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        let autoscaler_rows = sqlx::query(
            r#"
            SELECT c.namespace, c.name, s.observed_at, s.current_replicas, s.desired_replicas
            FROM autoscaler_samples s
            JOIN scheduled_autoscaler_changes c ON c.id = s.scheduled_autoscaler_change_id
            WHERE c.event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        let mut observations = Vec::with_capacity(pool_rows.len() + autoscaler_rows.len());
        for row in &pool_rows {
            observations.push(ObservationSample::NodePool {
                event_id,
                node_pool_name: row.try_get("node_pool_name")?,
                observed_at: row.try_get("observed_at")?,
                node_count: row.try_get("node_count")?,
            });
        }
        for row in &autoscaler_rows {
            observations.push(ObservationSample::Autoscaler {
                event_id,
                namespace: row.try_get("namespace")?,
                name: row.try_get("name")?,
                observed_at: row.try_get("observed_at")?,
                current_replicas: row.try_get("current_replicas")?,
                desired_replicas: row.try_get("desired_replicas")?,
            });
        }

        observations.sort_by_key(|o| o.observed_at());
        Ok(observations)
    }
}
