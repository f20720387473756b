//! In-memory cluster used by the gateway, inspector and scheduler tests

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, Node, NodeStatus, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{AutoscalerObject, AutoscalerVersion, ClusterApi, NODE_OS_LABEL, NODE_POOL_LABEL};
use crate::error::{PrescaleError, Result};

pub struct MockClusterApi {
    pub autoscalers: Mutex<HashMap<String, Vec<AutoscalerObject>>>,
    pub failing_namespaces: HashSet<String>,
    pub nodes: Vec<Node>,
    pub daemon_sets: Vec<DaemonSet>,
    pub deployments: HashMap<(String, String), Deployment>,
    pub preferred_version: String,
    pub fail_replace: bool,
    pub list_calls: AtomicUsize,
    pub replace_calls: AtomicUsize,
    pub replaced: Mutex<Vec<AutoscalerObject>>,
}

impl Default for MockClusterApi {
    fn default() -> Self {
        Self {
            autoscalers: Mutex::new(HashMap::new()),
            failing_namespaces: HashSet::new(),
            nodes: Vec::new(),
            daemon_sets: Vec::new(),
            deployments: HashMap::new(),
            preferred_version: "autoscaling/v2".to_string(),
            fail_replace: false,
            list_calls: AtomicUsize::new(0),
            replace_calls: AtomicUsize::new(0),
            replaced: Mutex::new(Vec::new()),
        }
    }
}

impl MockClusterApi {
    pub fn with_autoscaler(self, object: AutoscalerObject) -> Self {
        self.autoscalers
            .lock()
            .unwrap()
            .entry(object.namespace())
            .or_default()
            .push(object);
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_daemon_set(mut self, daemon_set: DaemonSet) -> Self {
        self.daemon_sets.push(daemon_set);
        self
    }

    pub fn with_deployment(mut self, deployment: Deployment) -> Self {
        let key = (
            deployment.metadata.namespace.clone().unwrap_or_default(),
            deployment.metadata.name.clone().unwrap_or_default(),
        );
        self.deployments.insert(key, deployment);
        self
    }

    pub fn failing_namespace(mut self, namespace: &str) -> Self {
        self.failing_namespaces.insert(namespace.to_string());
        self
    }
}

/// An API server error response as the kube client reports it
pub fn api_error(code: u16, message: &str) -> PrescaleError {
    PrescaleError::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: String::new(),
        code,
    }))
}

fn matches_selector(node: &Node, selector: &str) -> bool {
    let labels = node.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(|l| l == v).unwrap_or(false),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterApi for MockClusterApi {
    async fn list_autoscalers(
        &self,
        namespace: &str,
        version: AutoscalerVersion,
    ) -> Result<Vec<AutoscalerObject>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_namespaces.contains(namespace) {
            return Err(api_error(503, &format!("namespace {} unavailable", namespace)));
        }
        Ok(self
            .autoscalers
            .lock()
            .unwrap()
            .get(namespace)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|o| o.version() == version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn replace_autoscaler(&self, object: &AutoscalerObject) -> Result<AutoscalerObject> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_replace {
            return Err(api_error(409, "conflict"));
        }
        self.replaced.lock().unwrap().push(object.clone());
        Ok(object.clone())
    }

    async fn list_nodes(
        &self,
        label_selector: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<Node>> {
        let limit = limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(self
            .nodes
            .iter()
            .filter(|n| label_selector.map(|s| matches_selector(n, s)).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_daemon_sets(&self, namespace: &str) -> Result<Vec<DaemonSet>> {
        Ok(self
            .daemon_sets
            .iter()
            .filter(|ds| ds.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        self.deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| api_error(404, &format!("deployment {}/{} not found", namespace, name)))
    }

    async fn preferred_autoscaler_version(&self) -> Result<String> {
        Ok(self.preferred_version.clone())
    }
}

fn requests(cpu: &str, memory: &str) -> ResourceRequirements {
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(cpu.to_string()));
    requests.insert("memory".to_string(), Quantity(memory.to_string()));
    ResourceRequirements {
        requests: Some(requests),
        ..Default::default()
    }
}

fn pod_template(
    cpu: &str,
    memory: &str,
    node_selector: Option<BTreeMap<String, String>>,
) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: None,
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                resources: Some(requests(cpu, memory)),
                ..Default::default()
            }],
            node_selector,
            ..Default::default()
        }),
    }
}

/// A linux node in `pool` with the given allocatable resources
pub fn node(name: &str, pool: &str, cpu: &str, memory: &str) -> Node {
    let mut labels = BTreeMap::new();
    labels.insert(NODE_POOL_LABEL.to_string(), pool.to_string());
    labels.insert(NODE_OS_LABEL.to_string(), "linux".to_string());

    let mut allocatable = BTreeMap::new();
    allocatable.insert("cpu".to_string(), Quantity(cpu.to_string()));
    allocatable.insert("memory".to_string(), Quantity(memory.to_string()));
    allocatable.insert("pods".to_string(), Quantity("110".to_string()));

    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            allocatable: Some(allocatable),
            ..Default::default()
        }),
    }
}

/// Add an extra label to a node
pub fn labeled(mut node: Node, key: &str, value: &str) -> Node {
    node.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    node
}

/// A single-container daemon set, optionally pinned to an operating system
pub fn daemon_set(name: &str, os: Option<&str>, cpu: &str, memory: &str) -> DaemonSet {
    let node_selector = os.map(|os| {
        let mut selector = BTreeMap::new();
        selector.insert(NODE_OS_LABEL.to_string(), os.to_string());
        selector
    });

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            template: pod_template(cpu, memory, node_selector),
            ..Default::default()
        }),
        status: None,
    }
}

/// A single-container deployment with an optional node selector
pub fn deployment(
    namespace: &str,
    name: &str,
    cpu: &str,
    memory: &str,
    node_selector: &[(&str, &str)],
) -> Deployment {
    let node_selector = if node_selector.is_empty() {
        None
    } else {
        Some(
            node_selector
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            template: pod_template(cpu, memory, node_selector),
            ..Default::default()
        }),
        status: None,
    }
}
