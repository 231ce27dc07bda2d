//! Disk Cache Store
//!
//! Flat scratch directory holding one file per asset, named after the asset.
//! Writes land in a hidden temp file and are renamed into place only once
//! fully flushed, so a file under an asset's name is always complete.
//! Every async disk operation is bounded by the store's I/O timeout.

use std::future::Future;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::errors::{AssetError, AssetResult};
use crate::config::Timeouts;

/// Prefix and suffix of in-progress downloads
const TEMP_PREFIX: &str = ".partial-";
const TEMP_SUFFIX: &str = ".tmp";

/// Run a disk operation, failing with `TimedOut` if it exceeds `limit`
async fn bounded<T>(limit: Duration, op: impl Future<Output = io::Result<T>>) -> io::Result<T> {
    tokio::time::timeout(limit, op).await.unwrap_or_else(|_| {
        Err(io::Error::new(
            ErrorKind::TimedOut,
            format!("disk operation exceeded {:?}", limit),
        ))
    })
}

/// A cached asset opened for reading
pub struct CachedFile {
    /// Open handle, closed on drop
    pub file: File,
    /// Size on disk in bytes
    pub len: u64,
}

/// In-progress write of one asset
///
/// Dropping the writer without calling [`CacheWriter::commit`] deletes the
/// temp file and leaves any previous copy of the asset untouched.
pub struct CacheWriter {
    name: String,
    target: PathBuf,
    file: File,
    temp: TempPath,
    written: u64,
    io_timeout: Duration,
}

impl CacheWriter {
    /// Append a chunk to the temp file
    pub async fn write(&mut self, chunk: &[u8]) -> AssetResult<()> {
        bounded(self.io_timeout, self.file.write_all(chunk))
            .await
            .map_err(|e| AssetError::storage(&self.name, e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush, sync and move the file into place under the asset's name
    pub async fn commit(mut self) -> AssetResult<PathBuf> {
        bounded(self.io_timeout, self.file.flush())
            .await
            .map_err(|e| AssetError::storage(&self.name, e))?;
        bounded(self.io_timeout, self.file.sync_all())
            .await
            .map_err(|e| AssetError::storage(&self.name, e))?;
        drop(self.file);

        self.temp
            .persist(&self.target)
            .map_err(|e| AssetError::storage(&self.name, e.error))?;

        debug!(
            asset = %self.name,
            local = %self.target.display(),
            size = self.written,
            "Stored asset in disk cache"
        );
        Ok(self.target)
    }
}

/// Local disk cache for downloaded asset bytes
pub struct DiskCache {
    /// Root directory for cached files
    cache_dir: PathBuf,
    /// Bound on each disk operation
    io_timeout: Duration,
}

impl DiskCache {
    /// Create a disk cache rooted at `cache_dir`
    ///
    /// The directory itself is created lazily on first write.
    pub fn new(cache_dir: PathBuf) -> Self {
        let cache = Self {
            cache_dir,
            io_timeout: Timeouts::default().disk,
        };

        // Clean up any stale temp files from previous runs
        cache.cleanup();

        info!(cache_dir = %cache.cache_dir.display(), "Disk cache initialized");
        cache
    }

    /// Replace the default bound on disk operations
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// True iff a complete file for `name` is present
    pub async fn exists(&self, name: &str) -> bool {
        let Ok(path) = self.path_for(name) else {
            return false;
        };
        bounded(self.io_timeout, tokio::fs::metadata(&path))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Open a cached asset for reading
    ///
    /// Fails with `NotFound` unless a regular file is present under `name`.
    pub async fn open_for_read(&self, name: &str) -> AssetResult<CachedFile> {
        let path = self.path_for(name)?;
        let file = bounded(self.io_timeout, File::open(&path))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => AssetError::NotFound(name.to_string()),
                _ => AssetError::storage(name, e),
            })?;
        let metadata = bounded(self.io_timeout, file.metadata())
            .await
            .map_err(|e| AssetError::storage(name, e))?;
        if !metadata.is_file() {
            return Err(AssetError::NotFound(name.to_string()));
        }
        Ok(CachedFile {
            file,
            len: metadata.len(),
        })
    }

    /// Start writing an asset, creating the cache directory if needed
    pub async fn open_for_write(&self, name: &str) -> AssetResult<CacheWriter> {
        let target = self.path_for(name)?;

        bounded(self.io_timeout, tokio::fs::create_dir_all(&self.cache_dir))
            .await
            .map_err(|e| AssetError::storage(name, e))?;

        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.cache_dir)
            .map_err(|e| AssetError::storage(name, e))?;
        let (std_file, temp) = temp.into_parts();

        Ok(CacheWriter {
            name: name.to_string(),
            target,
            file: File::from_std(std_file),
            temp,
            written: 0,
            io_timeout: self.io_timeout,
        })
    }

    /// Remove the whole cache directory; a missing directory is not an error
    pub async fn clear(&self) -> AssetResult<()> {
        match bounded(self.io_timeout, tokio::fs::remove_dir_all(&self.cache_dir)).await {
            Ok(()) => {
                info!(cache_dir = %self.cache_dir.display(), "Cleared disk cache");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AssetError::storage("*", e)),
        }
    }

    /// Clean up stale temp files on startup
    pub fn cleanup(&self) {
        // Remove any partial downloads left from interrupted runs
        if let Ok(read_dir) = std::fs::read_dir(&self.cache_dir) {
            for entry in read_dir.flatten() {
                let file_name = entry.file_name();
                let file_name = file_name.to_string_lossy();
                if file_name.starts_with(TEMP_PREFIX) && file_name.ends_with(TEMP_SUFFIX) {
                    debug!(path = %entry.path().display(), "Removing stale temp file");
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }

    /// Map an asset name to its file, rejecting anything but a plain file name
    fn path_for(&self, name: &str) -> AssetResult<PathBuf> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\', '\0'])
            && Path::new(name).file_name().map(|f| f == name).unwrap_or(false);
        if !valid {
            return Err(AssetError::InvalidName(name.to_string()));
        }
        Ok(self.cache_dir.join(name))
    }

    /// Get the cache directory path
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}
