//! Request Dispatcher
//!
//! Decides per download request whether to serve the asset from disk or send
//! the client to upstream, and kicks off a background fetch so later requests
//! hit the disk cache.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::response::AssetResponse;
use crate::cache::{AssetError, AssetMetadata, AssetRegistry, AssetResult, DiskCache, Fetcher};
use crate::upstream::UpstreamClient;

/// Chooses between disk hit and upstream redirect
pub struct Dispatcher {
    registry: Arc<AssetRegistry>,
    store: Arc<DiskCache>,
    fetcher: Arc<Fetcher>,
    upstream: UpstreamClient,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<AssetRegistry>,
        store: Arc<DiskCache>,
        fetcher: Arc<Fetcher>,
        upstream: UpstreamClient,
    ) -> Self {
        Self {
            registry,
            store,
            fetcher,
            upstream,
        }
    }

    /// Answer a download request for `asset`
    ///
    /// Never fails: upstream and precondition errors are logged and turned
    /// into a bare 5xx.
    pub async fn serve_or_proxy(
        &self,
        asset: &AssetMetadata,
        credential: Option<&str>,
    ) -> AssetResponse {
        match self.dispatch(asset, credential).await {
            Ok(response) => response,
            Err(e) => {
                error!(asset = %asset.name, error = %e, "Download request failed");
                AssetResponse::Failure {
                    status: e.client_status(),
                }
            }
        }
    }

    async fn dispatch(
        &self,
        asset: &AssetMetadata,
        credential: Option<&str>,
    ) -> AssetResult<AssetResponse> {
        let name = asset.name.as_str();

        // Fast path: the flag must be set and the file must open
        if self.registry.is_cached(name) {
            match self.store.open_for_read(name).await {
                Ok(file) => {
                    debug!(asset = name, size = file.len, "Serving asset from disk");
                    return Ok(AssetResponse::File {
                        content_type: asset.content_type.clone(),
                        file_name: asset.name.clone(),
                        file,
                    });
                }
                Err(AssetError::NotFound(_)) => {
                    warn!(asset = name, "Cached asset vanished from disk, falling back to upstream");
                }
                Err(e) => return Err(e),
            }
        }

        let credential = credential.filter(|c| !c.is_empty());

        if self.fetcher.spawn(asset.clone(), credential.map(str::to_string)) {
            debug!(asset = name, "Started background fetch");
        }

        let Some(credential) = credential else {
            return Err(AssetError::MissingCredential(asset.name.clone()));
        };

        warn!(asset = name, "Asset not cached on disk yet, redirecting to upstream");
        let url = self
            .upstream
            .resolve_url(&asset.upstream_url, Some(credential))
            .map_err(|e| AssetError::fetch(name, e))?;
        let location = self
            .upstream
            .discover_redirect(url)
            .await
            .map_err(|e| AssetError::fetch(name, e))?;

        Ok(AssetResponse::Redirect { location })
    }
}
