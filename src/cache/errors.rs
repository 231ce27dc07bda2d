//! Asset cache error types

use reqwest::StatusCode;

use crate::upstream::UpstreamError;

/// Result type alias for asset cache operations
pub type AssetResult<T> = Result<T, AssetError>;

/// Errors raised by the registry, disk store, fetcher and dispatcher
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Asset not on disk: {0}")]
    NotFound(String),

    #[error("Unknown asset: {0}")]
    UnknownAsset(String),

    #[error("Invalid asset name: {0:?}")]
    InvalidName(String),

    #[error("Fetch of {name} failed: {source}")]
    Fetch {
        name: String,
        #[source]
        source: UpstreamError,
    },

    #[error("Disk cache I/O failed for {name}: {source}")]
    Storage {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Concurrent fetch of {name} failed: {reason}")]
    SharedFetch { name: String, reason: String },

    #[error("Fetch of {0} was cancelled before completing")]
    Cancelled(String),

    #[error("No cached copy and no credential available for {0}")]
    MissingCredential(String),
}

impl AssetError {
    pub fn fetch(name: &str, source: UpstreamError) -> Self {
        AssetError::Fetch {
            name: name.to_string(),
            source,
        }
    }

    pub fn storage(name: &str, source: std::io::Error) -> Self {
        AssetError::Storage {
            name: name.to_string(),
            source,
        }
    }

    /// Whether a later fetch attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            AssetError::Fetch { source, .. } => source.is_retryable(),
            AssetError::Storage { .. } | AssetError::SharedFetch { .. } | AssetError::Cancelled(_) => true,
            _ => false,
        }
    }

    /// Status code presented to a client whose request failed with this error
    pub fn client_status(&self) -> StatusCode {
        match self {
            AssetError::UnknownAsset(_) | AssetError::NotFound(_) => StatusCode::NOT_FOUND,
            AssetError::Fetch { source, .. } => source.client_status(),
            AssetError::SharedFetch { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
