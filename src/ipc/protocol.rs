//! Control socket protocol
//!
//! Newline-delimited JSON spoken over the daemon's Unix socket by the
//! release indexer and by operators.

use serde::{Deserialize, Serialize};

use crate::cache::AssetMetadata;
use crate::service::AssetSummary;

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Commands sent to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Register or update a release asset
    #[serde(rename_all = "camelCase")]
    RegisterAsset {
        /// Asset name, also its file name on disk
        name: String,
        /// Upstream API URL for the asset
        upstream_url: String,
        /// MIME type to serve it with
        content_type: String,
        /// Declared size in bytes
        #[serde(default)]
        size_bytes: u64,
    },
    /// Download a registered asset to disk and wait for completion
    Prefetch {
        /// Asset name
        name: String,
    },
    /// Remove every cached file
    ClearCache,
    /// Get daemon status and the asset list
    GetStatus,
}

impl Command {
    /// Metadata carried by a `RegisterAsset` command
    pub fn into_metadata(self) -> Option<AssetMetadata> {
        match self {
            Command::RegisterAsset {
                name,
                upstream_url,
                content_type,
                size_bytes,
            } => Some(AssetMetadata::new(&name, &upstream_url, &content_type, size_bytes)),
            _ => None,
        }
    }
}

/// Responses sent back by the daemon
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// Success response
    #[serde(rename_all = "camelCase")]
    Success {
        /// Optional success message
        message: Option<String>,
    },
    /// Error response
    #[serde(rename_all = "camelCase")]
    Error {
        /// Error message
        error: String,
    },
    /// Status response with cache state
    #[serde(rename_all = "camelCase")]
    Status {
        /// Protocol version
        version: u32,
        /// Whether daemon is healthy
        healthy: bool,
        /// Fetches currently running
        in_flight: usize,
        /// Registered assets
        assets: Vec<AssetSummary>,
    },
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n'); // Add newline delimiter
    Ok(json)
}
