//! HTTP front end for download requests

pub mod http;

pub use self::http::HttpServer;
