//! Release-asset host client

pub mod client;
pub mod errors;

pub use client::UpstreamClient;
pub use errors::UpstreamError;
