//! Cluster access for the prescaler
//!
//! This module provides:
//! - [`ClusterApi`], the narrow set of cluster reads and writes the
//!   scheduler needs, implemented against a live cluster by [`KubeClusterApi`]
//! - the version-polymorphic [`AutoscalerGateway`] with its short-lived list cache
//! - the capacity inspector and target resolver built on top of it

mod autoscaler;
mod capacity;
mod gateway;
mod kube_api;
mod quantity;
mod target;

#[cfg(test)]
pub(crate) mod mock;

pub use autoscaler::{
    AutoscalerObject, AutoscalerSnapshot, AutoscalerVersion, ScaleTargetRef,
};
pub use capacity::{background_overhead, pool_capacity, BackgroundOverhead};
pub use gateway::{AutoscalerCache, AutoscalerGateway};
pub use kube_api::{KubeClusterApi, KubeClusterApiBuilder};
pub use quantity::{quantity_value, RequestedResources};
pub use target::{resolve, WorkloadShape};

#[cfg(test)]
pub(crate) use autoscaler::fixtures;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Node;

use crate::error::Result;

/// Node label naming the node pool a node belongs to
pub const NODE_POOL_LABEL: &str = "cloud.google.com/gke-nodepool";

/// Node label carrying the node operating system
pub const NODE_OS_LABEL: &str = "kubernetes.io/os";

/// Namespace whose daemon sets count as per-node overhead
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// Cluster operations used while prescaling and watching an event
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List autoscalers in `namespace` using the given schema version
    async fn list_autoscalers(
        &self,
        namespace: &str,
        version: AutoscalerVersion,
    ) -> Result<Vec<AutoscalerObject>>;

    /// Replace an autoscaler object, returning the stored result
    async fn replace_autoscaler(&self, object: &AutoscalerObject) -> Result<AutoscalerObject>;

    /// List nodes matching an optional label selector
    async fn list_nodes(&self, label_selector: Option<&str>, limit: Option<u32>)
        -> Result<Vec<Node>>;

    /// List daemon sets in `namespace`
    async fn list_daemon_sets(&self, namespace: &str) -> Result<Vec<DaemonSet>>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;

    /// Preferred group version of the `autoscaling` API group, e.g. `autoscaling/v2`
    async fn preferred_autoscaler_version(&self) -> Result<String>;
}

/// Render a label map as an equality-based label selector
pub fn label_selector<'a, I>(labels: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    labels
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_label_selector() {
        let mut labels = BTreeMap::new();
        labels.insert("tier".to_string(), "web".to_string());
        labels.insert(NODE_POOL_LABEL.to_string(), "pool-a".to_string());

        assert_eq!(
            label_selector(&labels),
            "cloud.google.com/gke-nodepool=pool-a,tier=web"
        );
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }
}
