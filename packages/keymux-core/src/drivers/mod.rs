//! Built-in [`Driver`](crate::driver::Driver) implementations.
//!
//! - [`MemoryDriver`]: in-process reference backend
//! - [`FsDriver`]: path-mapped backend with watcher and traversal guard
//! - [`OverlayDriver`]: layered composition with tombstones

pub mod fs;
pub mod memory;
pub mod overlay;

pub use fs::{FsDriver, FsDriverConfig, DEFAULT_IGNORES};
pub use memory::MemoryDriver;
pub use overlay::{OverlayDriver, TOMBSTONE};
