//! Dispatcher outcomes, independent of the HTTP stack that sends them

use reqwest::StatusCode;

use crate::cache::CachedFile;

/// How a download request is answered
pub enum AssetResponse {
    /// Stream the asset from the disk cache
    File {
        content_type: String,
        file_name: String,
        file: CachedFile,
    },
    /// Send the client to the upstream-provided location
    Redirect { location: String },
    /// Generic failure; details stay in the server log
    Failure { status: StatusCode },
}

impl AssetResponse {
    pub fn status(&self) -> StatusCode {
        match self {
            AssetResponse::File { .. } => StatusCode::OK,
            AssetResponse::Redirect { .. } => StatusCode::FOUND,
            AssetResponse::Failure { status } => *status,
        }
    }

    /// `Content-Disposition` value for disk hits
    pub fn content_disposition(file_name: &str) -> String {
        format!("attachment; filename={}", file_name)
    }
}

impl std::fmt::Debug for AssetResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetResponse::File {
                content_type,
                file_name,
                file,
            } => f
                .debug_struct("File")
                .field("content_type", content_type)
                .field("file_name", file_name)
                .field("len", &file.len)
                .finish(),
            AssetResponse::Redirect { location } => {
                f.debug_struct("Redirect").field("location", location).finish()
            }
            AssetResponse::Failure { status } => {
                f.debug_struct("Failure").field("status", status).finish()
            }
        }
    }
}
