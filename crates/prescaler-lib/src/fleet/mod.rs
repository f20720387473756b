//! Fleet provisioning
//!
//! This module provides:
//! - [`FleetProvider`], the cloud node pool management API the prescaler
//!   drives, with the GKE implementation in [`GkeClient`]
//! - [`FleetProvisioner`], which raises a pool's ceiling and waits for the
//!   resulting long-running operation

mod gke;

pub use gke::{GkeClient, GkeClusterPath, DEFAULT_GKE_ENDPOINT};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{PrescaleError, Result};
use crate::observability::PrescalerMetrics;
use crate::shutdown::{self, ShutdownReceiver};

/// Operating system of a pool's nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolOs {
    Linux,
    Windows,
}

impl PoolOs {
    /// Value of the `kubernetes.io/os` node label
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolOs::Linux => "linux",
            PoolOs::Windows => "windows",
        }
    }

    /// Classify a provider image type such as `COS_CONTAINERD` or `WINDOWS_LTSC`
    pub fn from_image_type(image_type: &str) -> Self {
        if image_type.to_ascii_uppercase().starts_with("WINDOWS") {
            PoolOs::Windows
        } else {
            PoolOs::Linux
        }
    }
}

/// Node pool definition as reported by the fleet provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePool {
    pub name: String,
    pub min_node_count: i32,
    /// Current autoscaling ceiling
    pub max_node_count: i32,
    pub max_pods_per_node: i64,
    pub os: PoolOs,
    pub autoscaling_enabled: bool,
}

/// State of a long-running provider operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStatus {
    pub done: bool,
    /// Remote error message when the operation finished unsuccessfully
    pub error: Option<String>,
}

/// Node pool management API of a cloud provider
#[async_trait]
pub trait FleetProvider: Send + Sync {
    /// Node pools of the cluster
    async fn node_pools(&self) -> Result<Vec<NodePool>>;

    /// Submit a new autoscaling ceiling for `pool`, returning the operation name
    async fn set_max_node_count(&self, pool: &NodePool, max_node_count: i32) -> Result<String>;

    async fn operation(&self, name: &str) -> Result<OperationStatus>;
}

/// Provisioner settings
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Delay between operation status reads
    pub poll_interval: Duration,
    /// Upper bound for one ceiling raise, `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Some(Duration::from_secs(900)),
        }
    }
}

/// Raises node pool ceilings and waits for the provider to apply them
#[derive(Clone)]
pub struct FleetProvisioner {
    config: ProvisionerConfig,
    metrics: PrescalerMetrics,
}

impl FleetProvisioner {
    pub fn new(config: ProvisionerConfig) -> Self {
        Self {
            config,
            metrics: PrescalerMetrics::new(),
        }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Set `pool`'s ceiling to `new_max` and poll the operation to completion.
    ///
    /// The submission is never retried; only failed status reads are.
    pub async fn raise_ceiling(
        &self,
        provider: &dyn FleetProvider,
        pool: &NodePool,
        new_max: i32,
        shutdown: &ShutdownReceiver,
    ) -> Result<()> {
        shutdown::check(shutdown)?;
        let started = Instant::now();

        let operation = provider.set_max_node_count(pool, new_max).await?;
        info!(
            pool = %pool.name,
            new_max_nodes = new_max,
            operation = %operation,
            "Submitted node pool ceiling update"
        );

        let wait = self.wait_for(provider, &pool.name, &operation, shutdown.clone());
        match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                PrescaleError::ProvisioningTimeout {
                    pool: pool.name.clone(),
                    secs: limit.as_secs(),
                }
            })??,
            None => wait.await?,
        }

        self.metrics
            .observe_ceiling_raise(started.elapsed().as_secs_f64());
        info!(
            pool = %pool.name,
            new_max_nodes = new_max,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Node pool ceiling raised"
        );
        Ok(())
    }

    async fn wait_for(
        &self,
        provider: &dyn FleetProvider,
        pool: &str,
        operation: &str,
        mut shutdown: ShutdownReceiver,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown::signalled(&mut shutdown) => return Err(PrescaleError::Cancelled),
            }

            match provider.operation(operation).await {
                Ok(status) if status.done => {
                    return match status.error {
                        Some(message) => Err(PrescaleError::ProvisioningFailed {
                            pool: pool.to_string(),
                            message,
                        }),
                        None => Ok(()),
                    };
                }
                Ok(_) => debug!(pool = %pool, operation = %operation, "Operation still running"),
                Err(e) => warn!(
                    pool = %pool,
                    operation = %operation,
                    error = %e,
                    "Failed to read operation status, retrying"
                ),
            }
        }
    }
}

impl Default for FleetProvisioner {
    fn default() -> Self {
        Self::new(ProvisionerConfig::default())
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockFleetProvider;
    use super::*;
    use std::sync::atomic::Ordering;

    fn fast() -> FleetProvisioner {
        FleetProvisioner::new(ProvisionerConfig {
            poll_interval: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(5)),
        })
    }

    #[test]
    fn test_pool_os_from_image_type() {
        assert_eq!(PoolOs::from_image_type("COS_CONTAINERD"), PoolOs::Linux);
        assert_eq!(PoolOs::from_image_type("WINDOWS_LTSC_CONTAINERD"), PoolOs::Windows);
        assert_eq!(PoolOs::from_image_type(""), PoolOs::Linux);
    }

    #[tokio::test]
    async fn test_raise_ceiling_polls_until_done() {
        let provider = MockFleetProvider {
            polls_until_done: 3,
            ..Default::default()
        }
        .with_pool("pool-a", 3);
        let (_tx, rx) = shutdown::channel();

        fast()
            .raise_ceiling(&provider, &provider.pools[0], 9, &rx)
            .await
            .unwrap();

        assert_eq!(provider.submit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.poll_calls.load(Ordering::SeqCst), 3);
        assert_eq!(provider.ceilings.lock().unwrap()["pool-a"], 9);
    }

    #[tokio::test]
    async fn test_operation_error_is_provisioning_failure() {
        let provider = MockFleetProvider {
            operation_error: Some("quota exceeded".to_string()),
            ..Default::default()
        }
        .with_pool("pool-a", 3);
        let (_tx, rx) = shutdown::channel();

        let err = fast()
            .raise_ceiling(&provider, &provider.pools[0], 9, &rx)
            .await
            .unwrap_err();

        match err {
            PrescaleError::ProvisioningFailed { pool, message } => {
                assert_eq!(pool, "pool-a");
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_reads_are_retried_but_submission_is_not() {
        let provider = MockFleetProvider {
            fail_reads: 2,
            ..Default::default()
        }
        .with_pool("pool-a", 3);
        let (_tx, rx) = shutdown::channel();

        fast()
            .raise_ceiling(&provider, &provider.pools[0], 9, &rx)
            .await
            .unwrap();
        assert_eq!(provider.submit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.poll_calls.load(Ordering::SeqCst), 3);

        let rejecting = MockFleetProvider {
            fail_submit: true,
            ..Default::default()
        }
        .with_pool("pool-a", 3);
        let err = fast()
            .raise_ceiling(&rejecting, &rejecting.pools[0], 9, &rx)
            .await
            .unwrap_err();
        assert!(matches!(err, PrescaleError::FleetApi { status: 400, .. }));
        assert_eq!(rejecting.submit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(rejecting.poll_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout() {
        let provider = MockFleetProvider {
            polls_until_done: usize::MAX,
            ..Default::default()
        }
        .with_pool("pool-a", 3);
        let provisioner = FleetProvisioner::new(ProvisionerConfig {
            poll_interval: Duration::from_millis(1),
            timeout: Some(Duration::from_millis(30)),
        });
        let (_tx, rx) = shutdown::channel();

        let err = provisioner
            .raise_ceiling(&provider, &provider.pools[0], 9, &rx)
            .await
            .unwrap_err();
        assert!(matches!(err, PrescaleError::ProvisioningTimeout { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_abandons_polling() {
        let provider = MockFleetProvider {
            polls_until_done: usize::MAX,
            ..Default::default()
        }
        .with_pool("pool-a", 3);
        let provisioner = FleetProvisioner::new(ProvisionerConfig {
            poll_interval: Duration::from_millis(5),
            timeout: None,
        });
        let (tx, rx) = shutdown::channel();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
            tx
        });

        let err = provisioner
            .raise_ceiling(&provider, &provider.pools[0], 9, &rx)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        stopper.await.unwrap();
    }
}
