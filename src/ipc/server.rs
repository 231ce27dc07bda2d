//! IPC Server - Unix socket control channel
//!
//! Handles incoming connections from the release indexer and operators and
//! dispatches commands to the CacheManager.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::ipc::protocol::{parse_command, serialize_response, Command, Response, PROTOCOL_VERSION};
use crate::service::CacheManager;

/// IPC Server that listens for control commands
pub struct IpcServer {
    /// Cache service the commands act on
    manager: Arc<CacheManager>,
    /// Unix socket path
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
    /// Active connections counter
    connection_count: Arc<RwLock<u32>>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(manager: Arc<CacheManager>, socket_path: &Path) -> Self {
        Self {
            manager,
            socket_path: socket_path.to_path_buf(),
            listener: None,
            connection_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Start the IPC server
    pub async fn start(&mut self) -> Result<()> {
        // Clean up any existing socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        // Create the socket listener
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind Unix socket {}", self.socket_path.display()))?;

        info!(socket_path = %self.socket_path.display(), "IPC server started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the server loop, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let manager = Arc::clone(&self.manager);
                    let connection_count = Arc::clone(&self.connection_count);

                    // Spawn a new task to handle this connection
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, manager, connection_count).await {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Stop the IPC server and clean up
    pub async fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("Failed to remove socket file")?;
        }
        info!(connections = self.connection_count().await, "IPC server stopped");
        Ok(())
    }

    /// Get the number of active connections
    pub async fn connection_count(&self) -> u32 {
        *self.connection_count.read().await
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    manager: Arc<CacheManager>,
    connection_count: Arc<RwLock<u32>>,
) -> Result<()> {
    // Increment connection count
    {
        let mut count = connection_count.write().await;
        *count += 1;
        debug!(count = *count, "New connection");
    }

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    // Read commands line by line (newline-delimited JSON)
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Connection closed by client");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match parse_command(trimmed.as_bytes()) {
                    Ok(command) => process_command(command, &manager).await,
                    Err(e) => {
                        error!(error = %e, "Failed to parse command");
                        Response::Error {
                            error: format!("Invalid command: {}", e),
                        }
                    }
                };

                match serialize_response(&response) {
                    Ok(json) => {
                        if let Err(e) = writer.write_all(&json).await {
                            error!(error = %e, "Failed to write response");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize response");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    // Decrement connection count
    {
        let mut count = connection_count.write().await;
        *count = count.saturating_sub(1);
        debug!(count = *count, "Connection ended");
    }

    Ok(())
}

/// Process a command and return a response
async fn process_command(command: Command, manager: &CacheManager) -> Response {
    match command {
        command @ Command::RegisterAsset { .. } => {
            let Some(asset) = command.into_metadata() else {
                return Response::Error {
                    error: "Malformed registerAsset command".to_string(),
                };
            };
            info!(asset = %asset.name, size_mb = asset.size_mb(), "Processing registerAsset command");
            let message = format!("Registered {}", asset.name);
            manager.register(asset);
            Response::Success {
                message: Some(message),
            }
        }

        Command::Prefetch { name } => {
            info!(asset = %name, "Processing prefetch command");
            match manager.prefetch(&name).await {
                Ok(()) => Response::Success {
                    message: Some(format!("Cached {}", name)),
                },
                Err(e) => Response::Error {
                    error: format!("Prefetch failed: {}", e),
                },
            }
        }

        Command::ClearCache => {
            info!("Processing clearCache command");
            match manager.clear().await {
                Ok(()) => Response::Success { message: None },
                Err(e) => Response::Error {
                    error: format!("Clear failed: {}", e),
                },
            }
        }

        Command::GetStatus => {
            debug!("Processing getStatus command");
            Response::Status {
                version: PROTOCOL_VERSION,
                healthy: true,
                in_flight: manager.in_flight(),
                assets: manager.summaries(),
            }
        }
    }
}
