//! Live cluster access through the kube client

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::autoscaling::{v1, v2, v2beta2};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use tracing::debug;

use super::autoscaler::{AutoscalerObject, AutoscalerVersion};
use super::ClusterApi;
use crate::error::{PrescaleError, Result};

const AUTOSCALING_GROUP: &str = "autoscaling";
const DEFAULT_FIELD_MANAGER: &str = "event-prescaler";

/// [`ClusterApi`] backed by a kube [`Client`]
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    field_manager: String,
}

impl KubeClusterApi {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_autoscalers(
        &self,
        namespace: &str,
        version: AutoscalerVersion,
    ) -> Result<Vec<AutoscalerObject>> {
        let lp = ListParams::default();
        let objects = match version {
            AutoscalerVersion::V1 => {
                let api: Api<v1::HorizontalPodAutoscaler> =
                    Api::namespaced(self.client.clone(), namespace);
                api.list(&lp)
                    .await?
                    .items
                    .into_iter()
                    .map(AutoscalerObject::V1)
                    .collect()
            }
            AutoscalerVersion::V2beta2 => {
                let api: Api<v2beta2::HorizontalPodAutoscaler> =
                    Api::namespaced(self.client.clone(), namespace);
                api.list(&lp)
                    .await?
                    .items
                    .into_iter()
                    .map(AutoscalerObject::V2beta2)
                    .collect()
            }
            AutoscalerVersion::V2 => {
                let api: Api<v2::HorizontalPodAutoscaler> =
                    Api::namespaced(self.client.clone(), namespace);
                api.list(&lp)
                    .await?
                    .items
                    .into_iter()
                    .map(AutoscalerObject::V2)
                    .collect()
            }
        };
        Ok(objects)
    }

    async fn replace_autoscaler(&self, object: &AutoscalerObject) -> Result<AutoscalerObject> {
        let namespace = object.namespace();
        let name = object.name();
        let pp = self.post_params();

        let stored = match object {
            AutoscalerObject::V1(hpa) => {
                let api: Api<v1::HorizontalPodAutoscaler> =
                    Api::namespaced(self.client.clone(), &namespace);
                AutoscalerObject::V1(api.replace(&name, &pp, hpa).await?)
            }
            AutoscalerObject::V2beta2(hpa) => {
                let api: Api<v2beta2::HorizontalPodAutoscaler> =
                    Api::namespaced(self.client.clone(), &namespace);
                AutoscalerObject::V2beta2(api.replace(&name, &pp, hpa).await?)
            }
            AutoscalerObject::V2(hpa) => {
                let api: Api<v2::HorizontalPodAutoscaler> =
                    Api::namespaced(self.client.clone(), &namespace);
                AutoscalerObject::V2(api.replace(&name, &pp, hpa).await?)
            }
        };

        debug!(namespace = %namespace, autoscaler = %name, "Replaced autoscaler");
        Ok(stored)
    }

    async fn list_nodes(
        &self,
        label_selector: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<Node>> {
        let mut lp = ListParams::default();
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        if let Some(limit) = limit {
            lp = lp.limit(limit);
        }

        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&lp).await?.items)
    }

    async fn list_daemon_sets(&self, namespace: &str) -> Result<Vec<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn preferred_autoscaler_version(&self) -> Result<String> {
        let groups = self.client.list_api_groups().await?;
        groups
            .groups
            .into_iter()
            .find(|g| g.name == AUTOSCALING_GROUP)
            .and_then(|g| g.preferred_version)
            .map(|v| v.group_version)
            .ok_or_else(|| {
                PrescaleError::UnsupportedAutoscalerVersion(format!(
                    "{} group not served",
                    AUTOSCALING_GROUP
                ))
            })
    }
}

/// Builder for a [`KubeClusterApi`] from registered cluster details
pub struct KubeClusterApiBuilder {
    server_endpoint: String,
    certificate: String,
    token: Option<String>,
    field_manager: String,
}

impl KubeClusterApiBuilder {
    pub fn new(server_endpoint: impl Into<String>) -> Self {
        Self {
            server_endpoint: server_endpoint.into(),
            certificate: String::new(),
            token: None,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }

    /// Base64-encoded PEM bundle of the cluster CA
    pub fn certificate(mut self, certificate: impl Into<String>) -> Self {
        self.certificate = certificate.into();
        self
    }

    /// Bearer token presented to the API server
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    fn server_url(&self) -> String {
        if self.server_endpoint.starts_with("https://") || self.server_endpoint.starts_with("http://")
        {
            self.server_endpoint.clone()
        } else {
            format!("https://{}", self.server_endpoint)
        }
    }

    /// Render the in-memory kubeconfig document
    fn kubeconfig(&self) -> serde_json::Value {
        let mut user = json!({});
        if let Some(token) = &self.token {
            user["token"] = json!(token);
        }

        let mut cluster = json!({ "server": self.server_url() });
        if !self.certificate.is_empty() {
            cluster["certificate-authority-data"] = json!(self.certificate);
        }

        json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{ "name": "target", "cluster": cluster }],
            "users": [{ "name": "prescaler", "user": user }],
            "contexts": [{
                "name": "prescaler",
                "context": { "cluster": "target", "user": "prescaler" }
            }],
            "current-context": "prescaler",
        })
    }

    pub async fn build(self) -> Result<KubeClusterApi> {
        // JSON is a subset of YAML
        let kubeconfig = Kubeconfig::from_yaml(&self.kubeconfig().to_string())?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        let client = Client::try_from(config)?;

        Ok(KubeClusterApi::new(client, self.field_manager))
    }
}
