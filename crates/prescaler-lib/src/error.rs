//! Error taxonomy for the prescaler
//!
//! Every failure is classified into one [`ErrorKind`], which decides
//! whether it aborts a single change, a single node pool, or the event.

use thiserror::Error;

/// Coarse classification used to decide how far a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unsupported input, recorded on the affected change
    Validation,
    /// Missing autoscaler or empty node pool, aborts the affected unit
    NotFound,
    /// Cluster or fleet-provider call failed, aborts the event
    RemoteApi,
    /// A long-running provider operation reported failure
    ProvisioningFailed,
    /// Persistence failure
    Store,
    /// Shutdown requested, abandon without reporting
    Cancelled,
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid stored value: {0}")]
    Decode(String),

    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Errors raised while prescaling or watching an event
#[derive(Debug, Error)]
pub enum PrescaleError {
    #[error("unsupported autoscaler api version: {0}")]
    UnsupportedAutoscalerVersion(String),

    #[error("unsupported scale target {kind} ({api_version})")]
    UnsupportedTargetRef { kind: String, api_version: String },

    #[error("invalid cluster name {0}, expected gke_<project>_<cluster>_<location>")]
    InvalidClusterName(String),

    #[error("invalid credentials for datacenter {datacenter}: {reason}")]
    InvalidCredentials { datacenter: String, reason: String },

    #[error("autoscaler not found")]
    AutoscalerNotFound,

    #[error("no autoscaler exists")]
    NoAutoscalerExists,

    #[error("no node exists in node pool {0}")]
    NoNodeInPool(String),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("fleet api request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("fleet api returned {status}: {body}")]
    FleetApi { status: u16, body: String },

    #[error("autoscaler list for namespace {namespace} failed recently: {message}")]
    CachedListFailure { namespace: String, message: String },

    #[error("node pool {pool} provisioning failed: {message}")]
    ProvisioningFailed { pool: String, message: String },

    #[error("node pool {pool} provisioning did not finish within {secs}s")]
    ProvisioningTimeout { pool: String, secs: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cancelled by shutdown")]
    Cancelled,
}

impl PrescaleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PrescaleError::UnsupportedAutoscalerVersion(_)
            | PrescaleError::UnsupportedTargetRef { .. }
            | PrescaleError::InvalidClusterName(_)
            | PrescaleError::InvalidCredentials { .. } => ErrorKind::Validation,
            PrescaleError::AutoscalerNotFound
            | PrescaleError::NoAutoscalerExists
            | PrescaleError::NoNodeInPool(_) => ErrorKind::NotFound,
            PrescaleError::Kube(_)
            | PrescaleError::Kubeconfig(_)
            | PrescaleError::Http(_)
            | PrescaleError::FleetApi { .. }
            | PrescaleError::CachedListFailure { .. } => ErrorKind::RemoteApi,
            PrescaleError::ProvisioningFailed { .. } | PrescaleError::ProvisioningTimeout { .. } => {
                ErrorKind::ProvisioningFailed
            }
            PrescaleError::Store(_) => ErrorKind::Store,
            PrescaleError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

pub type Result<T, E = PrescaleError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            PrescaleError::UnsupportedTargetRef {
                kind: "StatefulSet".into(),
                api_version: "apps/v1".into()
            }
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(PrescaleError::NoNodeInPool("a".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            PrescaleError::FleetApi {
                status: 500,
                body: String::new()
            }
            .kind(),
            ErrorKind::RemoteApi
        );
        assert_eq!(
            PrescaleError::ProvisioningTimeout {
                pool: "a".into(),
                secs: 1
            }
            .kind(),
            ErrorKind::ProvisioningFailed
        );
        assert!(PrescaleError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_messages_persisted_on_events() {
        assert_eq!(PrescaleError::NoAutoscalerExists.to_string(), "no autoscaler exists");
        assert_eq!(PrescaleError::AutoscalerNotFound.to_string(), "autoscaler not found");
    }
}
