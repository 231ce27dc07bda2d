//! Cache Manager - owns the asset cache for the lifetime of the daemon
//!
//! Wires registry, disk store, fetcher and dispatcher together around one
//! cache directory and the server-side credential, and exposes the operations
//! used by the HTTP front end and the control socket.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{AssetError, AssetMetadata, AssetRegistry, AssetResult, DiskCache, Fetcher};
use crate::config::Config;
use crate::proxy::{AssetResponse, Dispatcher};
use crate::upstream::UpstreamClient;

/// Public view of one asset (for status and overview responses)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSummary {
    pub name: String,
    pub content_type: String,
    pub size_mb: f64,
    pub cached: bool,
}

impl From<&AssetMetadata> for AssetSummary {
    fn from(asset: &AssetMetadata) -> Self {
        Self {
            name: asset.name.clone(),
            content_type: asset.content_type.clone(),
            size_mb: asset.size_mb(),
            cached: asset.cached,
        }
    }
}

/// The release asset cache service
pub struct CacheManager {
    registry: Arc<AssetRegistry>,
    store: Arc<DiskCache>,
    fetcher: Arc<Fetcher>,
    dispatcher: Dispatcher,
    /// Server-side credential; never sent to clients
    credential: Option<String>,
}

impl CacheManager {
    /// Build the service from configuration
    pub fn new(config: &Config) -> Result<Self> {
        let upstream = UpstreamClient::new(&config.api_host, &config.timeouts)?;
        let store = DiskCache::new(config.cache_dir.clone()).with_io_timeout(config.timeouts.disk);
        Ok(Self::assemble(upstream, store, config.credential.clone()))
    }

    /// Build the service around an existing upstream client
    #[cfg(test)]
    pub fn with_upstream(
        upstream: UpstreamClient,
        cache_dir: std::path::PathBuf,
        credential: Option<String>,
    ) -> Self {
        Self::assemble(upstream, DiskCache::new(cache_dir), credential)
    }

    fn assemble(upstream: UpstreamClient, store: DiskCache, credential: Option<String>) -> Self {
        let registry = Arc::new(AssetRegistry::new());
        let store = Arc::new(store);
        let fetcher = Arc::new(Fetcher::new(
            upstream.clone(),
            Arc::clone(&store),
            Arc::clone(&registry),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&fetcher),
            upstream,
        );

        info!(
            cache_dir = %store.cache_dir().display(),
            credential = credential.is_some(),
            "Cache manager ready"
        );

        Self {
            registry,
            store,
            fetcher,
            dispatcher,
            credential,
        }
    }

    /// Register or update an asset
    pub fn register(&self, asset: AssetMetadata) {
        self.registry.upsert(asset);
    }

    #[cfg(test)]
    pub fn asset(&self, name: &str) -> Option<AssetMetadata> {
        self.registry.get(name)
    }

    /// Summaries of every registered asset, sorted by name
    pub fn summaries(&self) -> Vec<AssetSummary> {
        self.registry.list().iter().map(AssetSummary::from).collect()
    }

    /// Answer a download request for a registered asset
    pub async fn serve(&self, name: &str) -> AssetResponse {
        let Some(asset) = self.registry.get(name) else {
            debug!(asset = name, "Download requested for unknown asset");
            return AssetResponse::Failure {
                status: AssetError::UnknownAsset(name.to_string()).client_status(),
            };
        };
        self.dispatcher
            .serve_or_proxy(&asset, self.credential.as_deref())
            .await
    }

    /// Fetch a registered asset to disk and wait for it
    pub async fn prefetch(&self, name: &str) -> AssetResult<()> {
        let asset = self
            .registry
            .get(name)
            .ok_or_else(|| AssetError::UnknownAsset(name.to_string()))?;
        if asset.cached && self.store.exists(name).await {
            debug!(asset = name, "Prefetch skipped, already cached");
            return Ok(());
        }
        if self.fetcher.is_in_flight(name) {
            debug!(asset = name, "Prefetch joining running fetch");
        }
        self.fetcher
            .fetch_to_disk(&asset, self.credential.as_deref())
            .await
    }

    /// Remove every cached file and mark all assets uncached
    pub async fn clear(&self) -> AssetResult<()> {
        self.store.clear().await?;
        self.registry.reset_cached();
        info!("Asset cache cleared");
        Ok(())
    }

    /// Number of fetches currently running
    pub fn in_flight(&self) -> usize {
        self.fetcher.in_flight_count()
    }

    /// Log registry metrics; called on shutdown
    pub fn shutdown(&self) {
        self.registry.log_metrics();
        info!(in_flight = self.in_flight(), "Cache manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::test_support::{MockUpstream, Reply};
    use reqwest::StatusCode;

    fn manager(dir: &tempfile::TempDir, credential: Option<&str>) -> CacheManager {
        let upstream = UpstreamClient::new("127.0.0.1", &Timeouts::for_tests()).unwrap();
        CacheManager::with_upstream(
            upstream,
            dir.path().join("assets"),
            credential.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn test_serve_unknown_asset() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, Some("tok123"));
        let response = manager.serve("nope.bin").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_prefetch_then_clear() {
        let upstream = MockUpstream::start(vec![("/assets/1", Reply::Body(b"bytes".to_vec()))]).await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, Some("tok123"));
        manager.register(AssetMetadata::new(
            "foo.bin",
            &upstream.url("/assets/1"),
            "application/octet-stream",
            5,
        ));

        manager.prefetch("foo.bin").await.unwrap();
        // Second prefetch is served by the existing copy
        manager.prefetch("foo.bin").await.unwrap();
        assert_eq!(upstream.hits("/assets/1"), 1);
        assert!(manager.asset("foo.bin").unwrap().cached);
        assert_eq!(manager.serve("foo.bin").await.status(), StatusCode::OK);

        manager.clear().await.unwrap();

        assert!(!manager.asset("foo.bin").unwrap().cached);
        assert!(!dir.path().join("assets").join("foo.bin").exists());
        assert_eq!(
            manager.summaries(),
            vec![AssetSummary {
                name: "foo.bin".to_string(),
                content_type: "application/octet-stream".to_string(),
                size_mb: 0.0,
                cached: false,
            }]
        );
    }

    #[tokio::test]
    async fn test_prefetch_unknown_asset() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, None);
        let err = manager.prefetch("nope.bin").await.unwrap_err();
        assert!(matches!(err, AssetError::UnknownAsset(_)));
    }
}
