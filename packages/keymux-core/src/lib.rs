//! # keymux-core
//!
//! Unified asynchronous key-value storage: one logical namespace
//! multiplexed across pluggable backends ("drivers") via Unix-style
//! mount points.
//!
//! - **Mount routing**: longest-prefix dispatch over colon-separated keys
//! - **Drivers**: memory, filesystem (with change watching), overlay
//!   (layered composition with tombstones), plus a capability contract
//!   for writing your own
//! - **Serialization**: tolerant text channel and a raw byte channel that
//!   round-trips through text-only backends
//! - **Watching**: one subscriber surface aggregating events from every
//!   mounted backend
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keymux_core::{MemoryDriver, Storage};
//!
//! #[tokio::main]
//! async fn main() -> keymux_core::Result<()> {
//!     let storage = Storage::new();
//!
//!     storage.set("users:42:name", "alice").await?;
//!     storage.mount("cache:", Arc::new(MemoryDriver::new())).await?;
//!     storage.set("cache:session", 12345i64).await?;
//!
//!     // Both mounts contribute to one namespace.
//!     let keys = storage.list_keys("").await?;
//!     assert_eq!(keys.len(), 2);
//!     Ok(())
//! }
//! ```
//!
//! ## Overlay composition
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keymux_core::{Driver, MemoryDriver, OverlayDriver, Storage};
//!
//! #[tokio::main]
//! async fn main() -> keymux_core::Result<()> {
//!     let defaults = Arc::new(MemoryDriver::new()) as Arc<dyn Driver>;
//!     let overrides = Arc::new(MemoryDriver::new()) as Arc<dyn Driver>;
//!     let overlay = OverlayDriver::new(vec![overrides, defaults]);
//!
//!     let storage = Storage::with_root(Arc::new(overlay));
//!     // Reads fall through; writes land in the top layer; removes mask
//!     // lower layers with a tombstone.
//!     storage.set("cfg:port", 9090i64).await?;
//!     Ok(())
//! }
//! ```

pub mod driver;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod key;
pub mod prefixed;
pub mod serialize;
pub mod types;

pub use driver::{
    Capabilities, Driver, Metadata, Options, WatchCallback, WatchEvent, WatchGuard,
};
pub use drivers::{FsDriver, FsDriverConfig, MemoryDriver, OverlayDriver, TOMBSTONE};
pub use engine::{Storage, WatchId};
pub use error::{Result, StorageError};
pub use prefixed::PrefixedStorage;
pub use types::Value;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::driver::{Capabilities, Driver, Metadata, Options, WatchEvent};
    pub use crate::drivers::{FsDriver, FsDriverConfig, MemoryDriver, OverlayDriver};
    pub use crate::engine::Storage;
    pub use crate::error::{Result, StorageError};
    pub use crate::prefixed::PrefixedStorage;
    pub use crate::types::Value;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn storage_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<Storage>();
        assert_send_sync::<MemoryDriver>();
        assert_send_sync::<PrefixedStorage>();
    }

    #[tokio::test]
    async fn overlay_composes_with_mounts() {
        // Overlay read-through behind a mount point, end to end.
        let bottom = Arc::new(MemoryDriver::new());
        bottom
            .set("port", "8080".to_string(), &Options::new())
            .await
            .unwrap();
        let overlay =
            OverlayDriver::new(vec![Arc::new(MemoryDriver::new()) as Arc<dyn Driver>, bottom]);

        let storage = Storage::new();
        storage.mount("cfg:", Arc::new(overlay)).await.unwrap();

        assert_eq!(
            storage.get("cfg:port").await.unwrap(),
            Some(Value::Int(8080))
        );

        storage.remove("cfg:port").await.unwrap();
        assert!(storage.get("cfg:port").await.unwrap().is_none());
        assert!(!storage
            .list_keys("cfg:")
            .await
            .unwrap()
            .contains(&"cfg:port".to_string()));
    }
}
