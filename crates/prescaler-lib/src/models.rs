//! Core data models for the event prescaler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::cluster::AutoscalerVersion;

/// Lifecycle status of a scheduled event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventStatus {
    Pending,
    Executing,
    Prescaled,
    Watching,
    Success,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Executing => "EXECUTING",
            EventStatus::Prescaled => "PRESCALED",
            EventStatus::Watching => "WATCHING",
            EventStatus::Success => "SUCCESS",
            EventStatus::Failed => "FAILED",
        }
    }

    /// Returns true once no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Success | EventStatus::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EventStatus::Pending),
            "EXECUTING" => Ok(EventStatus::Executing),
            "PRESCALED" => Ok(EventStatus::Prescaled),
            "WATCHING" => Ok(EventStatus::Watching),
            "SUCCESS" => Ok(EventStatus::Success),
            "FAILED" => Ok(EventStatus::Failed),
            other => Err(format!("unknown event status: {}", other)),
        }
    }
}

/// A scheduled capacity reservation window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub cluster_id: Uuid,
    pub status: EventStatus,
    pub message: String,
}

/// Outcome of one scheduled autoscaler change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeStatus {
    Failed,
    Success,
    Pending,
    Scheduled,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Failed => "FAILED",
            ChangeStatus::Success => "SUCCESS",
            ChangeStatus::Pending => "PENDING",
            ChangeStatus::Scheduled => "SCHEDULED",
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FAILED" => Ok(ChangeStatus::Failed),
            "SUCCESS" => Ok(ChangeStatus::Success),
            "PENDING" => Ok(ChangeStatus::Pending),
            "SCHEDULED" => Ok(ChangeStatus::Scheduled),
            other => Err(format!("unknown change status: {}", other)),
        }
    }
}

/// One desired modification to one autoscaler object, owned by an event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledAutoscalerChange {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub namespace: String,
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
    pub status: ChangeStatus,
    pub message: String,
}

impl ScheduledAutoscalerChange {
    /// Whether this change targets the autoscaler `namespace/name`
    pub fn targets(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }
}

/// Status update for a single change, written in batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOutcome {
    pub change_id: Uuid,
    pub status: ChangeStatus,
    pub message: String,
}

impl ChangeOutcome {
    pub fn success(change_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            change_id,
            status: ChangeStatus::Success,
            message: message.into(),
        }
    }

    pub fn failed(change_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            change_id,
            status: ChangeStatus::Failed,
            message: message.into(),
        }
    }
}

/// Cloud provider owning a datacenter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatacenterProvider {
    Gcp,
}

impl DatacenterProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatacenterProvider::Gcp => "GCP",
        }
    }
}

impl FromStr for DatacenterProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GCP" => Ok(DatacenterProvider::Gcp),
            other => Err(format!("unknown datacenter provider: {}", other)),
        }
    }
}

/// A registered provider account holding the credentials for its clusters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datacenter {
    pub id: Uuid,
    pub name: String,
    pub provider: DatacenterProvider,
    /// Opaque credential blob handed to the credential exchange
    pub credentials: serde_json::Value,
}

/// A registered cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: Uuid,
    pub name: String,
    /// Base64-encoded PEM bundle of the cluster CA
    pub certificate: String,
    pub server_endpoint: String,
    pub datacenter: Datacenter,
    /// Cached latest autoscaler API version, `None` until discovered
    pub autoscaler_version: Option<AutoscalerVersion>,
}

/// Link between an event and a node pool it touched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedNodePoolRecord {
    pub id: Uuid,
    pub event_id: Uuid,
    pub node_pool_name: String,
    /// Planned ceiling, set once the plan raised this pool
    pub max_node_count: Option<i32>,
}

/// Node count of a provisioned pool at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePoolSample {
    pub provisioned_pool_id: Uuid,
    pub observed_at: DateTime<Utc>,
    pub node_count: i32,
}

/// Replica counts of a changed autoscaler at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerSample {
    pub change_id: Uuid,
    pub observed_at: DateTime<Utc>,
    pub current_replicas: i32,
    pub desired_replicas: i32,
}

/// Persisted observation, attributed back to its event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservationSample {
    NodePool {
        event_id: Uuid,
        node_pool_name: String,
        observed_at: DateTime<Utc>,
        node_count: i32,
    },
    Autoscaler {
        event_id: Uuid,
        namespace: String,
        name: String,
        observed_at: DateTime<Utc>,
        current_replicas: i32,
        desired_replicas: i32,
    },
}

impl ObservationSample {
    pub fn observed_at(&self) -> DateTime<Utc> {
        match self {
            ObservationSample::NodePool { observed_at, .. }
            | ObservationSample::Autoscaler { observed_at, .. } => *observed_at,
        }
    }
}
