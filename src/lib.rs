//! Escudeiro - a small HTTP gateway for a local content tree
//!
//! This library provides a gateway that:
//! - Renders HTML listings for directories below a content root
//! - Serves files under `/files/` with range and conditional request support
//! - Runs PHP scripts through a lazily started interpreter, with one-shot
//!   execution as the fallback
//! - Forwards `/api/` to a single upstream backend over a pooled client
//! - Rejects any path that would leave the content root

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod listing;
pub mod php;
pub mod pool;
pub mod proxy;
pub mod render;
pub mod resolver;
pub mod server;
pub mod static_files;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
