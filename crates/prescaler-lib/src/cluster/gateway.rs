//! Autoscaler gateway
//!
//! Reads and writes autoscaler objects of one cluster in the schema version
//! recorded for it. Listings go through a short-lived cache shared by every
//! run in the process; failed listings are cached as well so a failing
//! endpoint is not hammered by concurrent events.

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use super::autoscaler::{AutoscalerObject, AutoscalerSnapshot, AutoscalerVersion};
use super::ClusterApi;
use crate::error::{PrescaleError, Result};
use crate::observability::PrescalerMetrics;

type CacheKey = (Uuid, String, AutoscalerVersion);

#[derive(Clone)]
struct CacheEntry {
    stored_at: Instant,
    result: std::result::Result<Vec<AutoscalerObject>, String>,
}

/// Process-wide autoscaler list cache keyed by (cluster, namespace, version)
pub struct AutoscalerCache {
    entries: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
}

impl AutoscalerCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn get(&self, key: &CacheKey) -> Option<std::result::Result<Vec<AutoscalerObject>, String>> {
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(entry.result.clone())
        } else {
            None
        }
    }

    fn insert(&self, key: CacheKey, result: std::result::Result<Vec<AutoscalerObject>, String>) {
        self.entries.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                result,
            },
        );
    }

    fn invalidate(&self, key: &CacheKey) {
        self.entries.remove(key);
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for AutoscalerCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Version-aware access to the autoscalers of one cluster
pub struct AutoscalerGateway {
    api: Arc<dyn ClusterApi>,
    cluster_id: Uuid,
    version: AutoscalerVersion,
    cache: Arc<AutoscalerCache>,
    metrics: PrescalerMetrics,
}

impl AutoscalerGateway {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        cluster_id: Uuid,
        version: AutoscalerVersion,
        cache: Arc<AutoscalerCache>,
    ) -> Self {
        Self {
            api,
            cluster_id,
            version,
            cache,
            metrics: PrescalerMetrics::new(),
        }
    }

    pub fn version(&self) -> AutoscalerVersion {
        self.version
    }

    fn key(&self, namespace: &str) -> CacheKey {
        (self.cluster_id, namespace.to_string(), self.version)
    }

    /// List the live autoscaler objects of `namespace`
    pub async fn list_all(&self, namespace: &str) -> Result<Vec<AutoscalerObject>> {
        let key = self.key(namespace);

        if let Some(cached) = self.cache.get(&key) {
            self.metrics.inc_cache_lookup(true);
            return cached.map_err(|message| PrescaleError::CachedListFailure {
                namespace: namespace.to_string(),
                message,
            });
        }
        self.metrics.inc_cache_lookup(false);

        match self.api.list_autoscalers(namespace, self.version).await {
            Ok(objects) => {
                debug!(
                    cluster_id = %self.cluster_id,
                    namespace = %namespace,
                    version = %self.version,
                    count = objects.len(),
                    "Listed autoscalers"
                );
                self.cache.insert(key, Ok(objects.clone()));
                Ok(objects)
            }
            Err(e) => {
                self.cache.insert(key, Err(e.to_string()));
                Err(e)
            }
        }
    }

    /// Normalized view of the autoscalers of `namespace`
    pub async fn list_snapshots(&self, namespace: &str) -> Result<Vec<AutoscalerSnapshot>> {
        Ok(self
            .list_all(namespace)
            .await?
            .iter()
            .map(AutoscalerObject::snapshot)
            .collect())
    }

    /// Write `object` back to the cluster, last writer wins
    pub async fn update(&self, mut object: AutoscalerObject) -> Result<AutoscalerSnapshot> {
        object.clear_resource_version();
        let key = self.key(&object.namespace());

        let result = self.api.replace_autoscaler(&object).await;
        self.cache.invalidate(&key);
        self.metrics.inc_autoscaler_update(result.is_ok());

        Ok(result?.snapshot())
    }

    /// Write several objects concurrently; results keep the input order
    pub async fn update_batch(
        &self,
        objects: Vec<AutoscalerObject>,
    ) -> Vec<Result<AutoscalerSnapshot>> {
        join_all(objects.into_iter().map(|object| self.update(object))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fixtures::v2_autoscaler;
    use crate::cluster::mock::MockClusterApi;
    use std::sync::atomic::Ordering;

    fn gateway(api: Arc<MockClusterApi>, cache: Arc<AutoscalerCache>) -> AutoscalerGateway {
        AutoscalerGateway::new(api, Uuid::nil(), AutoscalerVersion::V2, cache)
    }

    #[tokio::test]
    async fn test_list_is_cached_per_namespace() {
        let api = Arc::new(
            MockClusterApi::default()
                .with_autoscaler(v2_autoscaler("shop", "checkout", 2, 10))
                .with_autoscaler(v2_autoscaler("blog", "web", 1, 3)),
        );
        let gateway = gateway(api.clone(), Arc::new(AutoscalerCache::default()));

        assert_eq!(gateway.list_all("shop").await.unwrap().len(), 1);
        assert_eq!(gateway.list_all("shop").await.unwrap().len(), 1);
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 1);

        let snapshots = gateway.list_snapshots("blog").await.unwrap();
        assert_eq!(snapshots[0].name, "web");
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_list_failure_is_cached() {
        let api = Arc::new(MockClusterApi::default().failing_namespace("shop"));
        let gateway = gateway(api.clone(), Arc::new(AutoscalerCache::default()));

        let first = gateway.list_all("shop").await.unwrap_err();
        assert!(matches!(first, PrescaleError::Kube(_)));

        let second = gateway.list_all("shop").await.unwrap_err();
        assert!(matches!(second, PrescaleError::CachedListFailure { .. }));
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_refetched() {
        let api = Arc::new(MockClusterApi::default().with_autoscaler(v2_autoscaler("shop", "a", 1, 2)));
        let cache = Arc::new(AutoscalerCache::new(Duration::ZERO));
        let gateway = gateway(api.clone(), cache.clone());

        gateway.list_all("shop").await.unwrap();
        gateway.list_all("shop").await.unwrap();
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 2);

        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_update_strips_resource_version_and_invalidates() {
        let api = Arc::new(MockClusterApi::default().with_autoscaler(v2_autoscaler("shop", "checkout", 2, 10)));
        let cache = Arc::new(AutoscalerCache::default());
        let gateway = gateway(api.clone(), cache.clone());

        let mut object = gateway.list_all("shop").await.unwrap().remove(0);
        assert_eq!(object.resource_version(), Some("42"));
        assert_eq!(cache.len(), 1);

        object.apply_bounds(Some(5), 40);
        let snapshot = gateway.update(object).await.unwrap();

        assert_eq!(snapshot.max_replicas, 40);
        assert!(cache.is_empty());
        let replaced = api.replaced.lock().unwrap();
        assert_eq!(replaced[0].resource_version(), None);
    }

    #[tokio::test]
    async fn test_update_batch_reports_each_result() {
        let api = Arc::new(MockClusterApi {
            fail_replace: true,
            ..Default::default()
        });
        let gateway = gateway(api.clone(), Arc::new(AutoscalerCache::default()));

        let results = gateway
            .update_batch(vec![
                v2_autoscaler("shop", "a", 1, 2),
                v2_autoscaler("shop", "b", 1, 2),
            ])
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(api.replace_calls.load(Ordering::SeqCst), 2);
    }
}
