//! Release Cache - disk cache and download proxy for release assets
//!
//! Serves release assets from a local disk cache, redirecting clients to the
//! upstream host while an asset is still being fetched.

mod cache;
mod config;
mod ipc;
mod proxy;
mod server;
mod service;
#[cfg(test)]
mod test_support;
mod upstream;

use anyhow::{anyhow, Result};
use std::env;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use cache::AssetMetadata;
use config::Config;
use ipc::IpcServer;
use server::HttpServer;
use service::CacheManager;

/// CLI command
#[derive(Debug, PartialEq)]
enum Command {
    /// Run HTTP front end and control socket (default)
    Serve,
    /// Fetch one asset into the cache directory
    Fetch {
        name: String,
        upstream_url: String,
        content_type: String,
    },
    /// Remove the cache directory
    Clear,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"Release Cache - disk cache and download proxy for release assets

USAGE:
    release-cache                                   # Run the daemon (default)
    release-cache serve
    release-cache fetch <name> <upstream_url> [content_type]
    release-cache clear
    release-cache help

COMMANDS:
    serve   Serve /download/<name> over HTTP and accept control commands
    fetch   Download one asset into the cache directory and exit
    clear   Delete the cache directory
    help    Show this help message

ENVIRONMENT:
    RELEASE_CACHE_DIR                    Cache directory
    RELEASE_CACHE_TOKEN / GITHUB_TOKEN   Upstream credential for private assets
    RELEASE_CACHE_API_HOST               Host that receives the credential (api.github.com)
    RELEASE_CACHE_LISTEN                 HTTP listen address (127.0.0.1:8080)
    RELEASE_CACHE_SOCKET                 Control socket path (/tmp/release-cache.sock)
    RELEASE_CACHE_REQUEST_TIMEOUT_SECS   Upstream request timeout (30)
    RELEASE_CACHE_CONNECT_TIMEOUT_SECS   Upstream connect timeout (10)
    RELEASE_CACHE_READ_TIMEOUT_SECS      Max idle time while downloading (60)
    RELEASE_CACHE_DISK_TIMEOUT_SECS      Bound on each disk cache operation (30)
    RUST_LOG                             Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args(args: &[String]) -> Result<Command> {
    if args.len() < 2 {
        return Ok(Command::Serve);
    }

    match args[1].as_str() {
        "serve" => Ok(Command::Serve),
        "fetch" => {
            if args.len() < 4 {
                return Err(anyhow!(
                    "Usage: release-cache fetch <name> <upstream_url> [content_type]"
                ));
            }
            Ok(Command::Fetch {
                name: args[2].clone(),
                upstream_url: args[3].clone(),
                content_type: args
                    .get(4)
                    .cloned()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            })
        }
        "clear" => Ok(Command::Clear),
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let args: Vec<String> = env::args().collect();
    let command = match parse_args(&args) {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if command == Command::Help {
        print_help();
        return Ok(());
    }

    let config = Config::from_env()?;
    let manager = Arc::new(CacheManager::new(&config)?);

    match command {
        Command::Serve => {
            info!("Starting release cache daemon");

            let mut http_server = HttpServer::new(Arc::clone(&manager));
            http_server.start(config.listen_addr).await?;

            let mut ipc_server = IpcServer::new(Arc::clone(&manager), &config.socket_path);
            if let Err(e) = ipc_server.start().await {
                error!(error = %e, "Failed to start IPC server");
                return Err(e);
            }
            let ipc_server = Arc::new(ipc_server);

            let http_handle = tokio::spawn(async move {
                if let Err(e) = http_server.run().await {
                    error!(error = %e, "HTTP server error");
                }
            });
            let ipc_running = Arc::clone(&ipc_server);
            let ipc_handle = tokio::spawn(async move {
                if let Err(e) = ipc_running.run().await {
                    error!(error = %e, "IPC server error");
                }
            });

            info!("Daemon ready. Press Ctrl+C to stop.");

            // Wait for Ctrl+C
            tokio::signal::ctrl_c().await?;

            info!("Received shutdown signal, stopping...");
            http_handle.abort();
            ipc_handle.abort();
            ipc_server.stop().await?;
            manager.shutdown();

            info!("Shutdown complete.");
        }
        Command::Fetch {
            name,
            upstream_url,
            content_type,
        } => {
            manager.register(AssetMetadata::new(&name, &upstream_url, &content_type, 0));
            if let Err(e) = manager.prefetch(&name).await {
                error!(asset = %name, error = %e, "Fetch failed");
                return Err(e.into());
            }
            println!("Cached {} in {}", name, config.cache_dir.display());
        }
        Command::Clear => {
            manager.clear().await?;
            println!("Cleared {}", config.cache_dir.display());
        }
        Command::Help => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("release-cache")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(parse_args(&args(&[])).unwrap(), Command::Serve);
        assert_eq!(parse_args(&args(&["serve"])).unwrap(), Command::Serve);
        assert_eq!(parse_args(&args(&["clear"])).unwrap(), Command::Clear);
        assert_eq!(parse_args(&args(&["bogus"])).unwrap(), Command::Help);
        assert_eq!(
            parse_args(&args(&["fetch", "foo.bin", "https://api.github.com/assets/1"])).unwrap(),
            Command::Fetch {
                name: "foo.bin".to_string(),
                upstream_url: "https://api.github.com/assets/1".to_string(),
                content_type: "application/octet-stream".to_string(),
            }
        );
        assert!(parse_args(&args(&["fetch", "foo.bin"])).is_err());
    }
}
