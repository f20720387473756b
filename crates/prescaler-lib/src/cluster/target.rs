//! Scale target resolution

use std::collections::BTreeMap;

use super::autoscaler::ScaleTargetRef;
use super::quantity::RequestedResources;
use super::ClusterApi;
use crate::error::{PrescaleError, Result};

const APPS_V1: &str = "apps/v1";
const DEPLOYMENT: &str = "Deployment";

/// Placement constraints and per-replica requests of a scaled workload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadShape {
    pub node_selector: BTreeMap<String, String>,
    /// CPU requested by one replica, in cores
    pub per_replica_cpu: f64,
    /// Memory requested by one replica, in bytes
    pub per_replica_memory: f64,
}

/// Resolve the workload behind an autoscaler.
///
/// Only `apps/v1` Deployments are understood; anything else is reported as
/// [`PrescaleError::UnsupportedTargetRef`].
pub async fn resolve(
    api: &dyn ClusterApi,
    target: &ScaleTargetRef,
    namespace: &str,
) -> Result<WorkloadShape> {
    if target.kind != DEPLOYMENT || target.api_version != APPS_V1 {
        return Err(PrescaleError::UnsupportedTargetRef {
            kind: target.kind.clone(),
            api_version: target.api_version.clone(),
        });
    }

    let deployment = api.get_deployment(namespace, &target.name).await?;
    let pod_spec = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref());

    let mut requested = RequestedResources::default();
    if let Some(pod_spec) = pod_spec {
        for container in &pod_spec.containers {
            requested.add_requests(container.resources.as_ref());
        }
    }

    Ok(WorkloadShape {
        node_selector: pod_spec
            .and_then(|s| s.node_selector.clone())
            .unwrap_or_default(),
        per_replica_cpu: requested.cpu,
        per_replica_memory: requested.memory,
    })
}
