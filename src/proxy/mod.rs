//! Download proxy decision logic

pub mod dispatcher;
pub mod response;

pub use dispatcher::Dispatcher;
pub use response::AssetResponse;
