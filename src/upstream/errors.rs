//! Upstream API Error Types
//!
//! Structured error handling for calls to the release-asset host.
//! Maps HTTP status codes to specific error variants for retry and response decisions.

use reqwest::StatusCode;

/// Release host error types
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Credential rejected by upstream")]
    Unauthorized,

    #[error("Rate limited by upstream")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),

    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),

    #[error("Upstream answered {0} without a redirect location")]
    MissingLocation(u16),
}

impl UpstreamError {
    /// Status code to hand back to a client whose request depended on this call
    pub fn client_status(&self) -> StatusCode {
        match self {
            UpstreamError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            UpstreamError::InvalidUrl(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::RateLimited
                | UpstreamError::Timeout
                | UpstreamError::Network(_)
                | UpstreamError::Server(_, _)
        )
    }

    /// Create an UpstreamError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => UpstreamError::Unauthorized,
            403 => UpstreamError::Forbidden(body.to_string()),
            404 => UpstreamError::NotFound(body.to_string()),
            408 => UpstreamError::Timeout,
            429 => UpstreamError::RateLimited,
            500..=599 => UpstreamError::Server(status, body.to_string()),
            _ => UpstreamError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        // Strip the URL: it may carry a credential in its userinfo
        let e = e.without_url();
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if e.is_connect() || e.is_body() || e.is_request() {
            UpstreamError::Network(e.to_string())
        } else {
            UpstreamError::Request(e.to_string())
        }
    }
}
