//! HTTP front end
//!
//! Minimal HTTP/1.1 server exposing the asset overview and the download route.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use crate::cache::CachedFile;
use crate::proxy::AssetResponse;
use crate::service::CacheManager;

type Body = BoxBody<Bytes, std::io::Error>;

/// Prefix of the download route; the rest of the path is the asset name
const DOWNLOAD_PREFIX: &str = "/download/";

/// HTTP server answering download requests from the cache
pub struct HttpServer {
    manager: Arc<CacheManager>,
    listener: Option<TcpListener>,
}

impl HttpServer {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self {
            manager,
            listener: None,
        }
    }

    /// Bind the listen address
    pub async fn start(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;
        let local_addr = listener.local_addr().context("Failed to read listener address")?;
        info!(addr = %local_addr, "HTTP server started");
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Run the accept loop
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let manager = Arc::clone(&self.manager);
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let manager = Arc::clone(&manager);
                            async move { Ok::<_, Infallible>(handle_request(req, &manager).await) }
                        });
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(peer = %peer, error = %e, "HTTP connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Route a request
async fn handle_request(req: Request<Incoming>, manager: &CacheManager) -> Response<Body> {
    if req.method() != Method::GET {
        return json_error(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "Method not allowed");
    }

    let path = req.uri().path();
    if path == "/" {
        return overview(manager);
    }

    let name = match path.strip_prefix(DOWNLOAD_PREFIX).map(urlencoding::decode) {
        Some(Ok(name)) if !name.is_empty() => name,
        Some(Err(_)) => {
            debug!(path, "Download path is not valid UTF-8 once decoded");
            return json_error(StatusCode::NOT_FOUND, "not_found", "Not found");
        }
        _ => return json_error(StatusCode::NOT_FOUND, "not_found", "Not found"),
    };

    let response = manager.serve(&name).await;
    debug!(asset = %name, status = %response.status(), "Download request answered");
    into_response(response)
}

/// JSON list of every registered asset
fn overview(manager: &CacheManager) -> Response<Body> {
    match serde_json::to_vec(&manager.summaries()) {
        Ok(json) => {
            let mut response = Response::new(full(json));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to serialize overview");
            internal_error(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Turn a dispatcher decision into an HTTP response
fn into_response(response: AssetResponse) -> Response<Body> {
    match response {
        AssetResponse::File {
            content_type,
            file_name,
            file,
        } => file_response(&content_type, &file_name, file),
        AssetResponse::Redirect { location } => match HeaderValue::from_str(&location) {
            Ok(location) => {
                let mut response = Response::new(empty());
                *response.status_mut() = StatusCode::FOUND;
                response.headers_mut().insert(LOCATION, location);
                response
            }
            Err(_) => {
                error!("Upstream redirect location is not a valid header value");
                internal_error(StatusCode::BAD_GATEWAY)
            }
        },
        AssetResponse::Failure { status } if status == StatusCode::NOT_FOUND => {
            json_error(status, "not_found", "Asset not found")
        }
        AssetResponse::Failure { status } => internal_error(status),
    }
}

/// Stream a cached file; the handle is released when the body is dropped
fn file_response(content_type: &str, file_name: &str, file: CachedFile) -> Response<Body> {
    let stream = ReaderStream::new(file.file).map_ok(Frame::data);
    let mut response = Response::new(StreamBody::new(stream).boxed());

    let headers = response.headers_mut();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(file.len));
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(disposition) = HeaderValue::from_str(&AssetResponse::content_disposition(file_name)) {
        headers.insert(CONTENT_DISPOSITION, disposition);
    }
    response
}

fn internal_error(status: StatusCode) -> Response<Body> {
    json_error(status, "internal_error", "Internal server error")
}

fn json_error(status: StatusCode, error: &str, message: &str) -> Response<Body> {
    let json = serde_json::json!({ "error": error, "message": message }).to_string();
    let mut response = Response::new(full(json));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn full(data: impl Into<Bytes>) -> Body {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

fn empty() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
