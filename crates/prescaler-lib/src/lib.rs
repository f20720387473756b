//! Event prescaler library
//!
//! This crate provides the core functionality for:
//! - Raising node pool ceilings and autoscaler bounds ahead of scheduled events
//! - Watching prescaled events and recording cluster observations
//! - Persistence of events, changes and samples
//! - Health checks and observability

pub mod cluster;
pub mod credentials;
pub mod error;
pub mod fleet;
pub mod health;
pub mod models;
pub mod observability;
pub mod planner;
pub mod scheduler;
pub mod shutdown;
pub mod store;

pub use error::{ErrorKind, PrescaleError, Result, StoreError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{PrescalerMetrics, StructuredLogger};
pub use scheduler::{EventRunner, Scheduler, SchedulerConfig};
pub use store::{EventStore, MemoryEventStore, PgEventStore};
