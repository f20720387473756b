//! Credential registry
//!
//! Datacenters store an opaque credential blob. A [`CredentialExchange`]
//! turns it into a [`TokenSource`], which the [`CredentialStore`] keeps per
//! datacenter name for the lifetime of the process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{PrescaleError, Result};
use crate::models::Datacenter;

/// Source of bearer tokens for cluster and fleet API calls
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Exchanges a datacenter's stored credentials for a token source
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    async fn exchange(&self, datacenter: &Datacenter) -> Result<Arc<dyn TokenSource>>;
}

/// A token that never changes
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Reads a ready-made `access_token` from the credential blob
#[derive(Debug, Clone, Default)]
pub struct StaticTokenExchange;

#[async_trait]
impl CredentialExchange for StaticTokenExchange {
    async fn exchange(&self, datacenter: &Datacenter) -> Result<Arc<dyn TokenSource>> {
        let token = datacenter
            .credentials
            .get("access_token")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PrescaleError::InvalidCredentials {
                datacenter: datacenter.name.clone(),
                reason: "missing access_token".to_string(),
            })?;

        Ok(Arc::new(StaticToken::new(token)))
    }
}

/// Token sources keyed by datacenter name
pub struct CredentialStore {
    sources: RwLock<HashMap<String, Arc<dyn TokenSource>>>,
    exchange: Arc<dyn CredentialExchange>,
}

impl CredentialStore {
    pub fn new(exchange: Arc<dyn CredentialExchange>) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            exchange,
        }
    }

    /// Register or replace the token source of a datacenter
    pub async fn register(&self, datacenter: &str, source: Arc<dyn TokenSource>) {
        self.sources
            .write()
            .await
            .insert(datacenter.to_string(), source);
    }

    pub async fn get(&self, datacenter: &str) -> Option<Arc<dyn TokenSource>> {
        self.sources.read().await.get(datacenter).cloned()
    }

    /// Token source of `datacenter`, exchanging its credentials on first use
    pub async fn token_source(&self, datacenter: &Datacenter) -> Result<Arc<dyn TokenSource>> {
        if let Some(source) = self.get(&datacenter.name).await {
            return Ok(source);
        }

        let source = self.exchange.exchange(datacenter).await?;
        let mut sources = self.sources.write().await;
        let source = sources
            .entry(datacenter.name.clone())
            .or_insert(source)
            .clone();
        info!(datacenter = %datacenter.name, "Registered datacenter token source");
        Ok(source)
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(Arc::new(StaticTokenExchange))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DatacenterProvider;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn datacenter(credentials: serde_json::Value) -> Datacenter {
        Datacenter {
            id: Uuid::new_v4(),
            name: "dc-eu".to_string(),
            provider: DatacenterProvider::Gcp,
            credentials,
        }
    }

    struct CountingExchange {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialExchange for CountingExchange {
        async fn exchange(&self, _datacenter: &Datacenter) -> Result<Arc<dyn TokenSource>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StaticToken::new(format!("token-{}", n))))
        }
    }

    #[tokio::test]
    async fn test_static_exchange_reads_access_token() {
        let source = StaticTokenExchange
            .exchange(&datacenter(json!({ "access_token": "abc" })))
            .await
            .unwrap();
        assert_eq!(source.token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_static_exchange_rejects_missing_token() {
        let err = StaticTokenExchange
            .exchange(&datacenter(json!({ "type": "service_account" })))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PrescaleError::InvalidCredentials { .. }));
    }

    #[tokio::test]
    async fn test_store_exchanges_once_per_datacenter() {
        let exchange = Arc::new(CountingExchange {
            calls: AtomicUsize::new(0),
        });
        let store = CredentialStore::new(exchange.clone());
        let dc = datacenter(json!({}));

        let first = store.token_source(&dc).await.unwrap();
        let second = store.token_source(&dc).await.unwrap();

        assert_eq!(first.token().await.unwrap(), "token-0");
        assert_eq!(second.token().await.unwrap(), "token-0");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_replaces_source() {
        let store = CredentialStore::default();
        store.register("dc-eu", Arc::new(StaticToken::new("old"))).await;
        store.register("dc-eu", Arc::new(StaticToken::new("new"))).await;

        let source = store.get("dc-eu").await.unwrap();
        assert_eq!(source.token().await.unwrap(), "new");
        assert!(store.get("dc-us").await.is_none());
    }
}
