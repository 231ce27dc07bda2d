//! Background Fetcher
//!
//! Pulls an asset from upstream into the disk cache and publishes it in the
//! registry once the file is durably in place. At most one fetch runs per asset
//! name; concurrent callers wait for and share the running fetch's outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::disk::DiskCache;
use super::errors::{AssetError, AssetResult};
use super::registry::{AssetMetadata, AssetRegistry};
use crate::upstream::UpstreamClient;

/// Final state of a fetch, as seen by callers that joined it
type Outcome = Option<Result<(), String>>;

/// In-flight fetches by asset name
type FlightMap = Arc<Mutex<HashMap<String, watch::Receiver<Outcome>>>>;

/// Ownership of the single running fetch for one asset
///
/// Dropping it, on completion or cancellation, clears the in-flight marker.
struct Flight {
    name: String,
    flights: FlightMap,
    done: watch::Sender<Outcome>,
}

impl Flight {
    fn finish(self, result: &AssetResult<()>) {
        let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
        // Nobody waiting is fine
        let _ = self.done.send(Some(outcome));
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        flights.remove(&self.name);
    }
}

enum Claim {
    /// This caller runs the fetch
    Leader(Flight),
    /// Another fetch is running; wait on it
    Follower(watch::Receiver<Outcome>),
}

/// Downloads assets to disk, one fetch per asset at a time
pub struct Fetcher {
    upstream: UpstreamClient,
    store: Arc<DiskCache>,
    registry: Arc<AssetRegistry>,
    flights: FlightMap,
}

impl Fetcher {
    pub fn new(upstream: UpstreamClient, store: Arc<DiskCache>, registry: Arc<AssetRegistry>) -> Self {
        Self {
            upstream,
            store,
            registry,
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetch an asset to disk and wait for it
    ///
    /// Joins an already running fetch for the same name instead of starting a
    /// second download. On success the asset is on disk and marked cached.
    pub async fn fetch_to_disk(
        &self,
        asset: &AssetMetadata,
        credential: Option<&str>,
    ) -> AssetResult<()> {
        match self.claim(&asset.name) {
            Claim::Leader(flight) => {
                let result = self.run(asset, credential).await;
                flight.finish(&result);
                result
            }
            Claim::Follower(mut done) => {
                debug!(asset = %asset.name, "Joining in-flight fetch");
                let outcome = match done.wait_for(Option::is_some).await {
                    Ok(outcome) => outcome.clone(),
                    Err(_) => None,
                };
                match outcome {
                    Some(Ok(())) => Ok(()),
                    Some(Err(reason)) => Err(AssetError::SharedFetch {
                        name: asset.name.clone(),
                        reason,
                    }),
                    None => Err(AssetError::Cancelled(asset.name.clone())),
                }
            }
        }
    }

    /// Start a fetch in the background unless one is already running
    ///
    /// Failures are logged and leave the asset uncached.
    ///
    /// # Returns
    /// true if a new fetch was started
    pub fn spawn(self: &Arc<Self>, asset: AssetMetadata, credential: Option<String>) -> bool {
        let Claim::Leader(flight) = self.claim(&asset.name) else {
            debug!(asset = %asset.name, "Fetch already in flight");
            return false;
        };

        let fetcher = Arc::clone(self);
        tokio::spawn(async move {
            let result = fetcher.run(&asset, credential.as_deref()).await;
            if let Err(e) = &result {
                warn!(
                    asset = %asset.name,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Background fetch failed"
                );
            }
            flight.finish(&result);
        });
        true
    }

    /// Whether a fetch for this asset is currently running
    pub fn is_in_flight(&self, name: &str) -> bool {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Number of fetches currently running
    pub fn in_flight_count(&self) -> usize {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn claim(&self, name: &str) -> Claim {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(done) = flights.get(name) {
            return Claim::Follower(done.clone());
        }
        let (done, receiver) = watch::channel(None);
        flights.insert(name.to_string(), receiver);
        Claim::Leader(Flight {
            name: name.to_string(),
            flights: Arc::clone(&self.flights),
            done,
        })
    }

    /// Download, write, then publish
    async fn run(&self, asset: &AssetMetadata, credential: Option<&str>) -> AssetResult<()> {
        let name = asset.name.as_str();
        let url = self
            .upstream
            .resolve_url(&asset.upstream_url, credential)
            .map_err(|e| AssetError::fetch(name, e))?;

        info!(asset = name, size_mb = asset.size_mb(), "Fetching asset to disk");

        let mut response = self
            .upstream
            .download(url)
            .await
            .map_err(|e| AssetError::fetch(name, e))?;

        let mut writer = self.store.open_for_write(name).await?;
        while let Some(chunk) = self
            .upstream
            .next_chunk(&mut response)
            .await
            .map_err(|e| AssetError::fetch(name, e))?
        {
            writer.write(&chunk).await?;
        }

        // Declared size is informational; the body's own framing decides completeness
        let received = writer.written();
        if asset.size_bytes > 0 && received != asset.size_bytes {
            warn!(
                asset = name,
                declared = asset.size_bytes,
                received,
                "Downloaded size differs from declared size"
            );
        }

        writer.commit().await?;

        if !self.registry.set_cached(name, &asset.upstream_url) {
            debug!(asset = name, "Asset replaced or unregistered during fetch");
        }

        info!(asset = name, size = received, "Asset cached on disk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::test_support::{MockUpstream, Reply};
    use crate::upstream::UpstreamError;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<DiskCache>,
        registry: Arc<AssetRegistry>,
        fetcher: Arc<Fetcher>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskCache::new(dir.path().join("assets")));
        let registry = Arc::new(AssetRegistry::new());
        let upstream = UpstreamClient::new("127.0.0.1", &Timeouts::for_tests()).unwrap();
        let fetcher = Arc::new(Fetcher::new(upstream, Arc::clone(&store), Arc::clone(&registry)));
        Harness {
            _dir: dir,
            store,
            registry,
            fetcher,
        }
    }

    fn register(h: &Harness, name: &str, url: String, size: u64) -> AssetMetadata {
        let asset = AssetMetadata::new(name, &url, "application/octet-stream", size);
        h.registry.upsert(asset.clone());
        asset
    }

    #[tokio::test]
    async fn test_fetch_publishes_after_write() {
        let upstream = MockUpstream::start(vec![("/assets/1", Reply::Body(b"release bytes".to_vec()))]).await;
        let h = harness();
        let asset = register(&h, "foo.bin", upstream.url("/assets/1"), 13);

        h.fetcher.fetch_to_disk(&asset, Some("tok123")).await.unwrap();

        assert!(h.store.exists("foo.bin").await);
        assert!(h.registry.get("foo.bin").unwrap().cached);
        let on_disk = std::fs::read(h.store.cache_dir().join("foo.bin")).unwrap();
        assert_eq!(on_disk, b"release bytes");
        assert!(!h.fetcher.is_in_flight("foo.bin"));

        let requests = upstream.requests();
        assert_eq!(requests[0].header("accept"), Some("application/octet-stream"));
        assert_eq!(requests[0].header("authorization"), Some("Basic dG9rMTIzOg=="));
    }

    #[tokio::test]
    async fn test_public_fetch_sends_no_credential() {
        let upstream = MockUpstream::start(vec![("/assets/1", Reply::Body(b"public".to_vec()))]).await;
        let h = harness();
        let asset = register(&h, "pub.bin", upstream.url("/assets/1"), 0);

        h.fetcher.fetch_to_disk(&asset, None).await.unwrap();

        assert!(h.registry.is_cached("pub.bin"));
        assert_eq!(upstream.requests()[0].header("authorization"), None);
    }

    #[tokio::test]
    async fn test_truncated_body_leaves_uncached() {
        let upstream = MockUpstream::start(vec![(
            "/assets/1",
            Reply::Truncated {
                declared: 1000,
                body: b"only a little".to_vec(),
            },
        )])
        .await;
        let h = harness();
        let asset = register(&h, "foo.bin", upstream.url("/assets/1"), 0);

        let err = h.fetcher.fetch_to_disk(&asset, None).await.unwrap_err();

        assert!(matches!(err, AssetError::Fetch { .. }), "{err}");
        assert!(!h.store.exists("foo.bin").await);
        assert!(!h.registry.get("foo.bin").unwrap().cached);
        assert!(!h.fetcher.is_in_flight("foo.bin"));
    }

    #[tokio::test]
    async fn test_declared_size_mismatch_still_caches() {
        let upstream = MockUpstream::start(vec![("/assets/1", Reply::Body(b"13 bytes long".to_vec()))]).await;
        let h = harness();
        let asset = register(&h, "foo.bin", upstream.url("/assets/1"), 14);

        h.fetcher.fetch_to_disk(&asset, None).await.unwrap();
        // Already cached, so no second download
        let file = h.store.open_for_read("foo.bin").await.unwrap();

        assert_eq!(file.len, 13);
        assert!(h.registry.is_cached("foo.bin"));
        assert_eq!(upstream.hits("/assets/1"), 1);
    }

    #[tokio::test]
    async fn test_upstream_error_status() {
        let upstream = MockUpstream::start(vec![("/assets/1", Reply::Status(401))]).await;
        let h = harness();
        let asset = register(&h, "foo.bin", upstream.url("/assets/1"), 0);

        let err = h.fetcher.fetch_to_disk(&asset, Some("expired")).await.unwrap_err();

        assert!(matches!(err, AssetError::Fetch { source: UpstreamError::Unauthorized, .. }));
        assert!(!h.registry.is_cached("foo.bin"));
    }

    #[tokio::test]
    async fn test_retry_after_failure_succeeds() {
        let upstream = MockUpstream::start(vec![("/assets/1", Reply::Status(503))]).await;
        let h = harness();
        let asset = register(&h, "foo.bin", upstream.url("/assets/1"), 0);

        assert!(h.fetcher.fetch_to_disk(&asset, None).await.is_err());

        upstream.route("/assets/1", Reply::Body(b"recovered".to_vec()));
        h.fetcher.fetch_to_disk(&asset, None).await.unwrap();
        assert!(h.registry.is_cached("foo.bin"));
    }

    #[tokio::test]
    async fn test_concurrent_fetches_coalesce() {
        let upstream = MockUpstream::start(vec![(
            "/assets/1",
            Reply::Delayed(Duration::from_millis(200), b"slow bytes".to_vec()),
        )])
        .await;
        let h = harness();
        let asset = register(&h, "foo.bin", upstream.url("/assets/1"), 0);

        let (a, b, c) = tokio::join!(
            h.fetcher.fetch_to_disk(&asset, None),
            h.fetcher.fetch_to_disk(&asset, None),
            h.fetcher.fetch_to_disk(&asset, None),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(upstream.hits("/assets/1"), 1);
        assert!(h.registry.is_cached("foo.bin"));
    }

    #[tokio::test]
    async fn test_spawn_is_single_flight() {
        let upstream = MockUpstream::start(vec![(
            "/assets/1",
            Reply::Delayed(Duration::from_millis(200), b"slow bytes".to_vec()),
        )])
        .await;
        let h = harness();
        let asset = register(&h, "foo.bin", upstream.url("/assets/1"), 0);

        assert!(h.fetcher.spawn(asset.clone(), None));
        assert!(!h.fetcher.spawn(asset.clone(), None));
        assert!(h.fetcher.is_in_flight("foo.bin"));
        assert_eq!(h.fetcher.in_flight_count(), 1);

        // A waiting caller shares the background fetch's outcome
        h.fetcher.fetch_to_disk(&asset, None).await.unwrap();
        assert_eq!(upstream.hits("/assets/1"), 1);
        assert!(h.registry.is_cached("foo.bin"));
    }

    #[tokio::test]
    async fn test_follower_sees_leader_failure() {
        let upstream = MockUpstream::start(vec![(
            "/assets/1",
            Reply::DelayedStatus(Duration::from_millis(200), 503),
        )])
        .await;
        let h = harness();
        let asset = register(&h, "foo.bin", upstream.url("/assets/1"), 0);

        assert!(h.fetcher.spawn(asset.clone(), None));
        let err = h.fetcher.fetch_to_disk(&asset, None).await.unwrap_err();

        assert!(matches!(err, AssetError::SharedFetch { .. }), "{err}");
        assert!(!h.registry.is_cached("foo.bin"));
    }

    #[tokio::test]
    async fn test_cancelled_fetch_clears_marker() {
        let upstream = MockUpstream::start(vec![("/assets/1", Reply::Stall)]).await;
        let h = harness();
        let asset = register(&h, "foo.bin", upstream.url("/assets/1"), 0);

        let attempt = tokio::time::timeout(
            Duration::from_millis(100),
            h.fetcher.fetch_to_disk(&asset, None),
        )
        .await;

        assert!(attempt.is_err());
        assert!(!h.fetcher.is_in_flight("foo.bin"));
        assert!(!h.store.exists("foo.bin").await);
    }
}
