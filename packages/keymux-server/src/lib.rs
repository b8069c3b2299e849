//! # keymux-server
//!
//! HTTP surface for a [`keymux_core::Storage`] engine, plus the matching
//! remote client driver and the `keymux` CLI binary.
//!
//! - [`StorageServer`]: deferred-startup axum server exposing the wire
//!   protocol (path = key, raw mode via content negotiation, meta
//!   headers, authorization and path-resolver hooks)
//! - [`HttpDriver`]: consumes that protocol as a mountable backend
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keymux_core::Storage;
//! use keymux_server::{ServerConfig, StorageServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = Arc::new(Storage::new());
//!     let mut server = StorageServer::new(storage, ServerConfig::default());
//!     server.start().await?;
//!     server.serve(std::future::pending()).await
//! }
//! ```

pub mod client;
pub mod config;
pub mod drain;
pub mod handlers;
pub mod middleware;
pub mod module;

pub use client::{HttpDriver, HttpDriverConfig};
pub use config::ServerConfig;
pub use drain::{RequestGuard, RequestTracker};
pub use handlers::{
    AccessMode, AppState, AuthCheck, Authorize, HttpError, PathResolver, RAW_CONTENT_TYPE,
    TTL_HEADER,
};
pub use module::StorageServer;

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
