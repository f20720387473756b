//! Per-cluster client construction

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::cluster::{ClusterApi, KubeClusterApiBuilder};
use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::fleet::{FleetProvider, GkeClient, GkeClusterPath, DEFAULT_GKE_ENDPOINT};
use crate::models::ClusterRecord;

/// Clients bound to one registered cluster
#[derive(Clone)]
pub struct ClusterHandles {
    pub cluster_api: Arc<dyn ClusterApi>,
    pub fleet: Arc<dyn FleetProvider>,
}

/// Builds the clients an event run needs for its cluster
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, cluster: &ClusterRecord) -> Result<ClusterHandles>;
}

/// Connects to GKE clusters using the datacenter's registered token source
pub struct GkeConnector {
    credentials: Arc<CredentialStore>,
    gke_endpoint: String,
    field_manager: String,
}

impl GkeConnector {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self {
            credentials,
            gke_endpoint: DEFAULT_GKE_ENDPOINT.to_string(),
            field_manager: "event-prescaler".to_string(),
        }
    }

    pub fn with_gke_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.gke_endpoint = endpoint.into();
        self
    }

    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }
}

#[async_trait]
impl ClusterConnector for GkeConnector {
    async fn connect(&self, cluster: &ClusterRecord) -> Result<ClusterHandles> {
        let path: GkeClusterPath = cluster.name.parse()?;
        let tokens = self.credentials.token_source(&cluster.datacenter).await?;
        let token = tokens.token().await?;

        let cluster_api = KubeClusterApiBuilder::new(cluster.server_endpoint.clone())
            .certificate(cluster.certificate.clone())
            .token(token)
            .field_manager(self.field_manager.clone())
            .build()
            .await?;
        let fleet = GkeClient::new(self.gke_endpoint.clone(), path, tokens)?;

        debug!(
            cluster = %cluster.name,
            datacenter = %cluster.datacenter.name,
            "Connected to cluster"
        );

        Ok(ClusterHandles {
            cluster_api: Arc::new(cluster_api),
            fleet: Arc::new(fleet),
        })
    }
}
