//! GKE node pool management over the Container REST API

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::{FleetProvider, NodePool, OperationStatus, PoolOs};
use crate::credentials::TokenSource;
use crate::error::{PrescaleError, Result};

pub const DEFAULT_GKE_ENDPOINT: &str = "https://container.googleapis.com";

/// Used when neither the pool nor the cluster declares a pod limit
const DEFAULT_MAX_PODS_PER_NODE: i64 = 110;

/// Project, cluster and location of a registered GKE cluster.
///
/// Registered cluster names follow `gke_<project>_<cluster>_<location>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GkeClusterPath {
    pub project: String,
    pub cluster: String,
    pub location: String,
}

impl FromStr for GkeClusterPath {
    type Err = PrescaleError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('_').collect();
        match parts.as_slice() {
            ["gke", project, cluster, location]
                if !project.is_empty() && !cluster.is_empty() && !location.is_empty() =>
            {
                Ok(Self {
                    project: project.to_string(),
                    cluster: cluster.to_string(),
                    location: location.to_string(),
                })
            }
            _ => Err(PrescaleError::InvalidClusterName(s.to_string())),
        }
    }
}

impl fmt::Display for GkeClusterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/locations/{}/clusters/{}",
            self.project, self.location, self.cluster
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterResource {
    #[serde(default)]
    node_pools: Vec<NodePoolResource>,
    default_max_pods_constraint: Option<MaxPodsConstraint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodePoolResource {
    name: String,
    config: Option<NodeConfig>,
    autoscaling: Option<Autoscaling>,
    max_pods_constraint: Option<MaxPodsConstraint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeConfig {
    #[serde(default)]
    image_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Autoscaling {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    min_node_count: i32,
    #[serde(default)]
    max_node_count: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaxPodsConstraint {
    /// int64 fields are encoded as strings by the REST API
    max_pods_per_node: serde_json::Value,
}

impl MaxPodsConstraint {
    fn value(&self) -> Option<i64> {
        match &self.max_pods_per_node {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetAutoscalingRequest {
    autoscaling: Autoscaling,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResource {
    name: String,
    #[serde(default)]
    status: String,
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    message: String,
}

/// [`FleetProvider`] for one GKE cluster
pub struct GkeClient {
    client: Client,
    endpoint: String,
    cluster: GkeClusterPath,
    tokens: Arc<dyn TokenSource>,
}

impl GkeClient {
    pub fn new(
        endpoint: impl Into<String>,
        cluster: GkeClusterPath,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            cluster,
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.endpoint, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let token = self.tokens.token().await?;
        let response = request.bearer_auth(token).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(PrescaleError::FleetApi { status, body });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl FleetProvider for GkeClient {
    async fn node_pools(&self) -> Result<Vec<NodePool>> {
        let cluster: ClusterResource = self
            .send(self.client.get(self.url(&self.cluster.to_string())))
            .await?;

        let cluster_default = cluster
            .default_max_pods_constraint
            .as_ref()
            .and_then(MaxPodsConstraint::value);

        Ok(cluster
            .node_pools
            .into_iter()
            .map(|pool| {
                let autoscaling = pool.autoscaling.unwrap_or_default();
                NodePool {
                    max_pods_per_node: pool
                        .max_pods_constraint
                        .as_ref()
                        .and_then(MaxPodsConstraint::value)
                        .or(cluster_default)
                        .unwrap_or(DEFAULT_MAX_PODS_PER_NODE),
                    os: PoolOs::from_image_type(
                        pool.config.as_ref().map(|c| c.image_type.as_str()).unwrap_or(""),
                    ),
                    min_node_count: autoscaling.min_node_count,
                    max_node_count: autoscaling.max_node_count,
                    autoscaling_enabled: autoscaling.enabled,
                    name: pool.name,
                }
            })
            .collect())
    }

    async fn set_max_node_count(&self, pool: &NodePool, max_node_count: i32) -> Result<String> {
        let path = format!("{}/nodePools/{}:setAutoscaling", self.cluster, pool.name);
        let body = SetAutoscalingRequest {
            autoscaling: Autoscaling {
                enabled: pool.autoscaling_enabled,
                min_node_count: pool.min_node_count,
                max_node_count,
            },
        };

        let operation: OperationResource =
            self.send(self.client.post(self.url(&path)).json(&body)).await?;
        Ok(operation.name)
    }

    async fn operation(&self, name: &str) -> Result<OperationStatus> {
        let path = format!(
            "projects/{}/locations/{}/operations/{}",
            self.cluster.project, self.cluster.location, name
        );
        let operation: OperationResource = self.send(self.client.get(self.url(&path))).await?;

        Ok(OperationStatus {
            done: operation.status == "DONE",
            error: operation
                .error
                .map(|e| e.message)
                .filter(|m| !m.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticToken;
    use mockito::Matcher;
    use serde_json::json;

    const CLUSTER_PATH: &str = "/v1/projects/shop-prod/locations/europe-west1/clusters/main";

    fn path() -> GkeClusterPath {
        "gke_shop-prod_main_europe-west1".parse().unwrap()
    }

    fn client(url: &str) -> GkeClient {
        GkeClient::new(url, path(), Arc::new(StaticToken::new("secret"))).unwrap()
    }

    #[test]
    fn test_cluster_path_parsing() {
        let path = path();
        assert_eq!(path.project, "shop-prod");
        assert_eq!(path.cluster, "main");
        assert_eq!(path.location, "europe-west1");
        assert_eq!(
            path.to_string(),
            "projects/shop-prod/locations/europe-west1/clusters/main"
        );

        assert!(matches!(
            "aks_main_westeurope".parse::<GkeClusterPath>(),
            Err(PrescaleError::InvalidClusterName(_))
        ));
        assert!("gke_a_b".parse::<GkeClusterPath>().is_err());
    }

    #[tokio::test]
    async fn test_node_pools() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", CLUSTER_PATH)
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "name": "main",
                    "defaultMaxPodsConstraint": { "maxPodsPerNode": "64" },
                    "nodePools": [
                        {
                            "name": "default-pool",
                            "config": { "imageType": "COS_CONTAINERD" },
                            "autoscaling": { "enabled": true, "minNodeCount": 1, "maxNodeCount": 3 },
                            "maxPodsConstraint": { "maxPodsPerNode": "32" }
                        },
                        {
                            "name": "win-pool",
                            "config": { "imageType": "WINDOWS_LTSC_CONTAINERD" }
                        }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let pools = client(&server.url()).node_pools().await.unwrap();
        mock.assert_async().await;

        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].name, "default-pool");
        assert_eq!(pools[0].max_node_count, 3);
        assert_eq!(pools[0].min_node_count, 1);
        assert_eq!(pools[0].max_pods_per_node, 32);
        assert_eq!(pools[0].os, PoolOs::Linux);
        assert!(pools[0].autoscaling_enabled);

        assert_eq!(pools[1].max_pods_per_node, 64);
        assert_eq!(pools[1].max_node_count, 0);
        assert_eq!(pools[1].os, PoolOs::Windows);
    }

    #[tokio::test]
    async fn test_set_max_node_count_keeps_pool_settings() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "POST",
                format!("{}/nodePools/default-pool:setAutoscaling", CLUSTER_PATH).as_str(),
            )
            .match_body(Matcher::Json(json!({
                "autoscaling": { "enabled": true, "minNodeCount": 1, "maxNodeCount": 9 }
            })))
            .with_status(200)
            .with_body(json!({ "name": "operation-123", "status": "RUNNING" }).to_string())
            .create_async()
            .await;

        let pool = NodePool {
            name: "default-pool".to_string(),
            min_node_count: 1,
            max_node_count: 3,
            max_pods_per_node: 110,
            os: PoolOs::Linux,
            autoscaling_enabled: true,
        };
        let operation = client(&server.url())
            .set_max_node_count(&pool, 9)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(operation, "operation-123");
    }

    #[tokio::test]
    async fn test_operation_status() {
        let mut server = mockito::Server::new_async().await;
        let base = "/v1/projects/shop-prod/locations/europe-west1/operations";
        server
            .mock("GET", format!("{}/op-running", base).as_str())
            .with_body(json!({ "name": "op-running", "status": "RUNNING" }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", format!("{}/op-failed", base).as_str())
            .with_body(
                json!({
                    "name": "op-failed",
                    "status": "DONE",
                    "error": { "code": 8, "message": "Insufficient regional quota" }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let gke = client(&server.url());
        let running = gke.operation("op-running").await.unwrap();
        assert!(!running.done);
        assert_eq!(running.error, None);

        let failed = gke.operation("op-failed").await.unwrap();
        assert!(failed.done);
        assert_eq!(failed.error.as_deref(), Some("Insufficient regional quota"));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", CLUSTER_PATH)
            .with_status(403)
            .with_body("permission denied")
            .create_async()
            .await;

        let err = client(&server.url()).node_pools().await.unwrap_err();
        match err {
            PrescaleError::FleetApi { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, "permission denied");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
