//! Cache service lifecycle

pub mod manager;

pub use manager::{AssetSummary, CacheManager};
