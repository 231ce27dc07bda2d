//! Release Host Client
//!
//! Talks to the upstream release-asset host: credential injection into the URL
//! authority, streamed asset downloads and manual-redirect discovery.

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::header::{ACCEPT, LOCATION};
use reqwest::{redirect, Client, Response, Url};
use std::time::Duration;
use tracing::{debug, warn};

use super::errors::UpstreamError;
use crate::config::Timeouts;

/// Every upstream call asks for the raw asset bytes
const OCTET_STREAM: &str = "application/octet-stream";

/// HTTP client for the release-asset host
#[derive(Clone)]
pub struct UpstreamClient {
    /// Follows redirects; used to pull asset bodies to disk
    download_client: Client,
    /// Never follows redirects; used to surface the `Location` header
    redirect_client: Client,
    /// Only URLs on this host receive the credential
    api_host: String,
    /// Maximum wait for response headers on a download
    request_timeout: Duration,
    /// Maximum idle time between two body chunks
    read_timeout: Duration,
}

impl UpstreamClient {
    /// Build the client pair for the given API host
    ///
    /// # Arguments
    /// * `api_host` - Host name whose URLs may carry the credential
    /// * `timeouts` - Connect, request and read bounds for upstream calls
    pub fn new(api_host: &str, timeouts: &Timeouts) -> Result<Self> {
        // Whole-request timeout would cut off large downloads, so the
        // download client is bounded on headers and per chunk instead.
        let download_client = Client::builder()
            .connect_timeout(timeouts.connect)
            .build()
            .context("Failed to create download HTTP client")?;

        let redirect_client = Client::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.request)
            .redirect(redirect::Policy::none())
            .build()
            .context("Failed to create redirect HTTP client")?;

        Ok(Self {
            download_client,
            redirect_client,
            api_host: api_host.to_string(),
            request_timeout: timeouts.request,
            read_timeout: timeouts.read,
        })
    }

    /// Resolve the URL to fetch, embedding the credential in its authority
    ///
    /// `https://api.host/x` becomes `https://<credential>@api.host/x`. URLs on
    /// any other host, and requests without a non-empty credential, are left
    /// untouched.
    pub fn resolve_url(
        &self,
        upstream_url: &str,
        credential: Option<&str>,
    ) -> Result<Url, UpstreamError> {
        let mut url =
            Url::parse(upstream_url).map_err(|e| UpstreamError::InvalidUrl(e.to_string()))?;

        let Some(credential) = credential.filter(|c| !c.is_empty()) else {
            return Ok(url);
        };

        if url.host_str() != Some(self.api_host.as_str()) {
            debug!(
                host = ?url.host_str(),
                api_host = %self.api_host,
                "Not injecting credential into foreign host"
            );
            return Ok(url);
        }

        url.set_username(credential)
            .map_err(|_| UpstreamError::InvalidUrl("URL cannot carry a credential".to_string()))?;
        Ok(url)
    }

    /// Start downloading an asset, following redirects to the storage backend
    ///
    /// Returns the response once a 2xx status is received; the body is pulled
    /// with [`UpstreamClient::next_chunk`].
    pub async fn download(&self, url: Url) -> Result<Response, UpstreamError> {
        let request = self
            .download_client
            .get(url)
            .header(ACCEPT, OCTET_STREAM)
            .send();
        let response = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| UpstreamError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status.as_u16(), &body));
        }

        Ok(response)
    }

    /// Read the next body chunk, failing if the upstream stalls
    pub async fn next_chunk(&self, response: &mut Response) -> Result<Option<Bytes>, UpstreamError> {
        match tokio::time::timeout(self.read_timeout, response.chunk()).await {
            Ok(chunk) => Ok(chunk?),
            Err(_) => Err(UpstreamError::Timeout),
        }
    }

    /// Ask upstream where the asset lives without following the redirect
    ///
    /// # Returns
    /// The raw `Location` header of the upstream 3xx response
    pub async fn discover_redirect(&self, url: Url) -> Result<String, UpstreamError> {
        let response = self
            .redirect_client
            .get(url)
            .header(ACCEPT, OCTET_STREAM)
            .send()
            .await?;

        let status = response.status();
        if status.is_redirection() {
            return response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or(UpstreamError::MissingLocation(status.as_u16()));
        }

        if status.is_success() {
            warn!(status = %status, "Upstream served the asset instead of redirecting");
            return Err(UpstreamError::MissingLocation(status.as_u16()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(UpstreamError::from_status(status.as_u16(), &body))
    }
}
