//! IPC module for control-socket communication
//!
//! Provides Unix socket server and JSON protocol for registering assets and
//! managing the cache from outside the daemon.

pub mod protocol;
pub mod server;

pub use server::IpcServer;
