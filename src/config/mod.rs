//! Daemon configuration
//!
//! Everything is read from environment variables at startup. Parsing goes
//! through a lookup closure so tests can supply their own variables.

use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default host whose asset URLs receive the credential
pub const DEFAULT_API_HOST: &str = "api.github.com";

/// Default HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Default control socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/release-cache.sock";

/// Bounds applied to upstream calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Whole-request bound for redirect discovery
    pub request: Duration,
    /// TCP/TLS connect bound for every upstream call
    pub connect: Duration,
    /// Maximum idle time between body chunks while fetching to disk
    pub read: Duration,
    /// Bound on each disk cache operation
    pub disk: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(30),
            connect: Duration::from_secs(10),
            read: Duration::from_secs(60),
            disk: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
impl Timeouts {
    /// Short bounds so failing tests do not hang
    pub fn for_tests() -> Self {
        Self {
            request: Duration::from_secs(2),
            connect: Duration::from_secs(2),
            read: Duration::from_secs(2),
            disk: Duration::from_secs(2),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Scratch directory holding one file per cached asset
    pub cache_dir: PathBuf,
    /// Server-side credential for private assets
    pub credential: Option<String>,
    /// Host whose URLs may carry the credential
    pub api_host: String,
    /// HTTP front end address
    pub listen_addr: SocketAddr,
    /// Control socket path
    pub socket_path: PathBuf,
    /// Upstream call bounds
    pub timeouts: Timeouts,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let cache_dir = match get("RELEASE_CACHE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_cache_dir(),
        };

        let credential = get("RELEASE_CACHE_TOKEN").or_else(|| get("GITHUB_TOKEN"));

        let api_host = get("RELEASE_CACHE_API_HOST").unwrap_or_else(|| DEFAULT_API_HOST.to_string());

        let listen = get("RELEASE_CACHE_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = listen
            .parse()
            .with_context(|| format!("Invalid RELEASE_CACHE_LISTEN address: {}", listen))?;

        let socket_path = get("RELEASE_CACHE_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            request: parse_secs(&get, "RELEASE_CACHE_REQUEST_TIMEOUT_SECS", defaults.request)?,
            connect: parse_secs(&get, "RELEASE_CACHE_CONNECT_TIMEOUT_SECS", defaults.connect)?,
            read: parse_secs(&get, "RELEASE_CACHE_READ_TIMEOUT_SECS", defaults.read)?,
            disk: parse_secs(&get, "RELEASE_CACHE_DISK_TIMEOUT_SECS", defaults.disk)?,
        };

        Ok(Self {
            cache_dir,
            credential,
            api_host,
            listen_addr,
            socket_path,
            timeouts,
        })
    }
}

/// Platform cache directory, falling back to /tmp
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("release-cache")
        .join("assets")
}

/// Parse a positive number of seconds
fn parse_secs<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{} must be a whole number of seconds, got {:?}", key, raw))?;
    if secs == 0 {
        return Err(anyhow!("{} must be greater than zero", key));
    }
    Ok(Duration::from_secs(secs))
}
