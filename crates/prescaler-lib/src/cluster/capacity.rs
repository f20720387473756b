//! Capacity inspection
//!
//! Measures what one more node of a pool can actually offer to workloads:
//! a representative node's allocatable resources minus the daemon set
//! overhead that lands on every node.

use k8s_openapi::api::apps::v1::DaemonSet;
use tracing::debug;

use super::quantity::{quantity_value, RequestedResources};
use super::{ClusterApi, NODE_OS_LABEL, NODE_POOL_LABEL, SYSTEM_NAMESPACE};
use crate::error::{PrescaleError, Result};
use crate::fleet::{NodePool, PoolOs};
use crate::planner::{NodePoolCapacity, ResourceVector};

/// Per-node overhead of daemon workloads
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BackgroundOverhead {
    pub pod_count: i64,
    pub cpu: f64,
    pub memory: f64,
}

fn runs_on(daemon_set: &DaemonSet, os: PoolOs) -> bool {
    let selector = daemon_set
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.node_selector.as_ref());

    selector
        .and_then(|s| s.get(NODE_OS_LABEL))
        .is_some_and(|value| value == os.as_str())
}

/// Sum the requests of the system daemon sets pinned to nodes of `os`.
///
/// Only `kube-system` daemon sets whose node selector names the operating
/// system count. Each qualifying daemon set counts as one pod per node.
pub async fn background_overhead(api: &dyn ClusterApi, os: PoolOs) -> Result<BackgroundOverhead> {
    let daemon_sets = api.list_daemon_sets(SYSTEM_NAMESPACE).await?;

    let mut overhead = BackgroundOverhead::default();
    let mut requested = RequestedResources::default();

    for daemon_set in daemon_sets.iter().filter(|ds| runs_on(ds, os)) {
        overhead.pod_count += 1;
        let containers = daemon_set
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|s| s.containers.as_slice())
            .unwrap_or_default();
        for container in containers {
            requested.add_requests(container.resources.as_ref());
        }
    }

    overhead.cpu = requested.cpu;
    overhead.memory = requested.memory;

    debug!(
        os = %os.as_str(),
        daemon_sets = overhead.pod_count,
        cpu = overhead.cpu,
        memory = overhead.memory,
        "Computed daemon set overhead"
    );

    Ok(overhead)
}

/// Capacity of `pool` sampled from one of its nodes.
///
/// Fails with [`PrescaleError::NoNodeInPool`] when the pool has no node to
/// sample allocatable resources from.
pub async fn pool_capacity(
    api: &dyn ClusterApi,
    pool: &NodePool,
    overhead: &BackgroundOverhead,
) -> Result<NodePoolCapacity> {
    let selector = format!("{}={}", NODE_POOL_LABEL, pool.name);
    let nodes = api.list_nodes(Some(&selector), Some(1)).await?;
    let node = nodes
        .first()
        .ok_or_else(|| PrescaleError::NoNodeInPool(pool.name.clone()))?;

    let allocatable = node.status.as_ref().and_then(|s| s.allocatable.as_ref());
    let allocatable_of = |resource: &str| {
        allocatable
            .and_then(|a| a.get(resource))
            .map(quantity_value)
            .unwrap_or(0.0)
    };

    let per_node = ResourceVector {
        pods: (pool.max_pods_per_node - overhead.pod_count).max(0) as f64,
        cpu: (allocatable_of("cpu") - overhead.cpu).max(0.0),
        memory: (allocatable_of("memory") - overhead.memory).max(0.0),
    };

    Ok(NodePoolCapacity::new(
        pool.name.clone(),
        pool.max_node_count,
        per_node,
    ))
}
