//! Horizontal autoscaler schema variants
//!
//! Clusters serve the autoscaler resource under three wire-incompatible
//! group versions. [`AutoscalerObject`] wraps the typed object of each and
//! normalizes it into an [`AutoscalerSnapshot`].

use k8s_openapi::api::autoscaling::{v1, v2, v2beta2};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PrescaleError;

/// Autoscaler API group version served by a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AutoscalerVersion {
    #[serde(rename = "autoscaling/v1")]
    V1,
    #[serde(rename = "autoscaling/v2beta2")]
    V2beta2,
    #[serde(rename = "autoscaling/v2")]
    V2,
}

impl AutoscalerVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoscalerVersion::V1 => "autoscaling/v1",
            AutoscalerVersion::V2beta2 => "autoscaling/v2beta2",
            AutoscalerVersion::V2 => "autoscaling/v2",
        }
    }
}

impl fmt::Display for AutoscalerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AutoscalerVersion {
    type Err = PrescaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "autoscaling/v1" => Ok(AutoscalerVersion::V1),
            "autoscaling/v2beta2" => Ok(AutoscalerVersion::V2beta2),
            "autoscaling/v2" => Ok(AutoscalerVersion::V2),
            other => Err(PrescaleError::UnsupportedAutoscalerVersion(other.to_string())),
        }
    }
}

/// Workload controlled by an autoscaler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleTargetRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// Version-independent view of an autoscaler object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerSnapshot {
    pub name: String,
    pub namespace: String,
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
    pub current_replicas: i32,
    pub desired_replicas: i32,
    pub scale_target_ref: ScaleTargetRef,
}

/// A live autoscaler object in whichever schema its cluster serves
#[derive(Debug, Clone)]
pub enum AutoscalerObject {
    V1(v1::HorizontalPodAutoscaler),
    V2beta2(v2beta2::HorizontalPodAutoscaler),
    V2(v2::HorizontalPodAutoscaler),
}

impl AutoscalerObject {
    pub fn version(&self) -> AutoscalerVersion {
        match self {
            AutoscalerObject::V1(_) => AutoscalerVersion::V1,
            AutoscalerObject::V2beta2(_) => AutoscalerVersion::V2beta2,
            AutoscalerObject::V2(_) => AutoscalerVersion::V2,
        }
    }

    fn metadata(&self) -> &ObjectMeta {
        match self {
            AutoscalerObject::V1(hpa) => &hpa.metadata,
            AutoscalerObject::V2beta2(hpa) => &hpa.metadata,
            AutoscalerObject::V2(hpa) => &hpa.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            AutoscalerObject::V1(hpa) => &mut hpa.metadata,
            AutoscalerObject::V2beta2(hpa) => &mut hpa.metadata,
            AutoscalerObject::V2(hpa) => &mut hpa.metadata,
        }
    }

    pub fn name(&self) -> String {
        self.metadata().name.clone().unwrap_or_default()
    }

    pub fn namespace(&self) -> String {
        self.metadata().namespace.clone().unwrap_or_default()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }

    /// Drop the optimistic concurrency token so the next write wins
    pub fn clear_resource_version(&mut self) {
        self.metadata_mut().resource_version = None;
    }

    pub fn scale_target_ref(&self) -> ScaleTargetRef {
        let (api_version, kind, name) = match self {
            AutoscalerObject::V1(hpa) => hpa
                .spec
                .as_ref()
                .map(|s| {
                    let r = &s.scale_target_ref;
                    (r.api_version.clone(), r.kind.clone(), r.name.clone())
                })
                .unwrap_or_default(),
            AutoscalerObject::V2beta2(hpa) => hpa
                .spec
                .as_ref()
                .map(|s| {
                    let r = &s.scale_target_ref;
                    (r.api_version.clone(), r.kind.clone(), r.name.clone())
                })
                .unwrap_or_default(),
            AutoscalerObject::V2(hpa) => hpa
                .spec
                .as_ref()
                .map(|s| {
                    let r = &s.scale_target_ref;
                    (r.api_version.clone(), r.kind.clone(), r.name.clone())
                })
                .unwrap_or_default(),
        };

        ScaleTargetRef {
            api_version: api_version.unwrap_or_default(),
            kind,
            name,
        }
    }

    /// Set the replica bounds on this copy; a `None` minimum keeps the live one
    pub fn apply_bounds(&mut self, min_replicas: Option<i32>, max_replicas: i32) {
        match self {
            AutoscalerObject::V1(hpa) => {
                let spec = hpa.spec.get_or_insert_with(Default::default);
                spec.max_replicas = max_replicas;
                if min_replicas.is_some() {
                    spec.min_replicas = min_replicas;
                }
            }
            AutoscalerObject::V2beta2(hpa) => {
                let spec = hpa.spec.get_or_insert_with(Default::default);
                spec.max_replicas = max_replicas;
                if min_replicas.is_some() {
                    spec.min_replicas = min_replicas;
                }
            }
            AutoscalerObject::V2(hpa) => {
                let spec = hpa.spec.get_or_insert_with(Default::default);
                spec.max_replicas = max_replicas;
                if min_replicas.is_some() {
                    spec.min_replicas = min_replicas;
                }
            }
        }
    }

    /// Normalize into the version-independent view
    pub fn snapshot(&self) -> AutoscalerSnapshot {
        // currentReplicas is optional in newer schema revisions and required
        // in older ones, `Option::from` accepts both shapes.
        let (min_replicas, max_replicas, current_replicas, desired_replicas) = match self {
            AutoscalerObject::V1(hpa) => {
                let spec = hpa.spec.as_ref();
                let status = hpa.status.as_ref();
                (
                    spec.and_then(|s| s.min_replicas),
                    spec.map(|s| s.max_replicas).unwrap_or_default(),
                    status
                        .and_then(|s| Option::<i32>::from(s.current_replicas))
                        .unwrap_or_default(),
                    status.map(|s| s.desired_replicas).unwrap_or_default(),
                )
            }
            AutoscalerObject::V2beta2(hpa) => {
                let spec = hpa.spec.as_ref();
                let status = hpa.status.as_ref();
                (
                    spec.and_then(|s| s.min_replicas),
                    spec.map(|s| s.max_replicas).unwrap_or_default(),
                    status
                        .and_then(|s| Option::<i32>::from(s.current_replicas))
                        .unwrap_or_default(),
                    status.map(|s| s.desired_replicas).unwrap_or_default(),
                )
            }
            AutoscalerObject::V2(hpa) => {
                let spec = hpa.spec.as_ref();
                let status = hpa.status.as_ref();
                (
                    spec.and_then(|s| s.min_replicas),
                    spec.map(|s| s.max_replicas).unwrap_or_default(),
                    status
                        .and_then(|s| Option::<i32>::from(s.current_replicas))
                        .unwrap_or_default(),
                    status.map(|s| s.desired_replicas).unwrap_or_default(),
                )
            }
        };

        AutoscalerSnapshot {
            name: self.name(),
            namespace: self.namespace(),
            min_replicas,
            max_replicas,
            current_replicas,
            desired_replicas,
            scale_target_ref: self.scale_target_ref(),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use k8s_openapi::api::autoscaling::v2::{
        CrossVersionObjectReference, HorizontalPodAutoscalerSpec, HorizontalPodAutoscalerStatus,
    };

    /// A v2 autoscaler targeting the Deployment of the same name
    pub fn v2_autoscaler(namespace: &str, name: &str, min: i32, max: i32) -> AutoscalerObject {
        AutoscalerObject::V2(v2::HorizontalPodAutoscaler {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: Some(HorizontalPodAutoscalerSpec {
                min_replicas: Some(min),
                max_replicas: max,
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".to_string()),
                    kind: "Deployment".to_string(),
                    name: name.to_string(),
                },
                ..Default::default()
            }),
            status: Some(HorizontalPodAutoscalerStatus {
                current_replicas: min.into(),
                desired_replicas: min,
                ..Default::default()
            }),
        })
    }
}
