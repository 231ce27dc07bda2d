//! Asset Metadata Registry
//!
//! In-memory record of every known release asset and whether it is fully on disk.
//! Reads go straight to a Moka cache; the few writers are serialized so a
//! re-indexed asset cannot be clobbered by a fetch completing for its old version.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use moka::sync::Cache;
use tracing::{debug, trace};

/// Metadata for one release asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetMetadata {
    /// Unique identifier, also the file name in the disk cache
    pub name: String,
    /// Upstream fetch URL, without any credential
    pub upstream_url: String,
    /// MIME type served with the asset
    pub content_type: String,
    /// Declared size in bytes (informational)
    pub size_bytes: u64,
    /// True once the complete asset has been written to disk
    pub cached: bool,
}

impl AssetMetadata {
    /// Create an uncached record
    pub fn new(name: &str, upstream_url: &str, content_type: &str, size_bytes: u64) -> Self {
        Self {
            name: name.to_string(),
            upstream_url: upstream_url.to_string(),
            content_type: content_type.to_string(),
            size_bytes,
            cached: false,
        }
    }

    /// Size in megabytes, rounded to one decimal
    pub fn size_mb(&self) -> f64 {
        (self.size_bytes as f64 / 100_000.0).round() / 10.0
    }
}

/// Registry of asset metadata keyed by asset name
pub struct AssetRegistry {
    /// Records by asset name
    assets: Cache<String, AssetMetadata>,
    /// Serializes read-modify-write updates
    write_lock: Mutex<()>,
    /// Lookups that found a cached asset
    hits: AtomicU64,
    /// Lookups that found an uncached or unknown asset
    misses: AtomicU64,
}

impl AssetRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            assets: Cache::builder().name("asset_registry").build(),
            write_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up an asset by name
    pub fn get(&self, name: &str) -> Option<AssetMetadata> {
        self.assets.get(name)
    }

    /// Whether the registry marks this asset as fully on disk
    ///
    /// Updates hit/miss counters.
    pub fn is_cached(&self, name: &str) -> bool {
        let cached = self.assets.get(name).map(|a| a.cached).unwrap_or(false);
        if cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(asset = name, "Registry HIT");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(asset = name, "Registry MISS");
        }
        cached
    }

    /// Insert or replace an asset record
    ///
    /// A record for the same upstream URL keeps its cached flag; a changed URL
    /// is a new version of the asset and starts uncached.
    pub fn upsert(&self, mut metadata: AssetMetadata) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        metadata.cached = match self.assets.get(&metadata.name) {
            Some(existing) if existing.upstream_url == metadata.upstream_url => existing.cached,
            _ => false,
        };
        debug!(asset = %metadata.name, cached = metadata.cached, "Registered asset");
        self.assets.insert(metadata.name.clone(), metadata);
    }

    /// Mark an asset as fully on disk
    ///
    /// Idempotent. Only flips the record if it still points at `upstream_url`,
    /// so a fetch finishing for a replaced version has no effect.
    pub fn set_cached(&self, name: &str, upstream_url: &str) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.assets.get(name) {
            Some(existing) if existing.cached => true,
            Some(mut existing) if existing.upstream_url == upstream_url => {
                existing.cached = true;
                self.assets.insert(name.to_string(), existing);
                debug!(asset = name, "Asset marked cached");
                true
            }
            _ => false,
        }
    }

    /// Reset every cached flag, used after the disk cache is cleared
    pub fn reset_cached(&self) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cached: Vec<AssetMetadata> = self
            .assets
            .iter()
            .map(|(_, a)| a)
            .filter(|a| a.cached)
            .collect();
        for mut asset in cached {
            asset.cached = false;
            self.assets.insert(asset.name.clone(), asset);
        }
        debug!("Reset cached flag on all assets");
    }

    /// All records, sorted by name
    pub fn list(&self) -> Vec<AssetMetadata> {
        let mut assets: Vec<AssetMetadata> = self.assets.iter().map(|(_, a)| a).collect();
        assets.sort_by(|a, b| a.name.cmp(&b.name));
        assets
    }

    /// Get registry statistics
    ///
    /// Returns (hits, misses, hit_rate)
    pub fn stats(&self) -> (u64, u64, f64) {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        (hits, misses, hit_rate)
    }

    /// Log current registry metrics
    pub fn log_metrics(&self) {
        let (hits, misses, hit_rate) = self.stats();
        debug!(
            hits = hits,
            misses = misses,
            hit_rate = format!("{:.1}%", hit_rate),
            assets = self.assets.entry_count(),
            "Registry metrics"
        );
    }
}

impl Default for AssetRegistry {
    fn default() -> Self {
        Self::new()
    }
}
