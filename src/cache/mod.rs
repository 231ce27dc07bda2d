//! Release asset caching layer
//!
//! Metadata registry, on-disk byte store and the background fetcher that
//! fills the store from upstream.

pub mod disk;
pub mod errors;
pub mod fetcher;
pub mod registry;

pub use disk::{CachedFile, DiskCache};
pub use errors::{AssetError, AssetResult};
pub use fetcher::Fetcher;
pub use registry::{AssetMetadata, AssetRegistry};
