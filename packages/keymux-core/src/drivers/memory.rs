//! In-memory [`Driver`] backed by [`DashMap`].
//!
//! Provides concurrent read/write access without external locking. The
//! reference backend: always available, no configuration, no persistence.
//! Also the default root driver of a freshly created storage engine.

use dashmap::DashMap;

use async_trait::async_trait;

use crate::driver::{Capabilities, Driver, Options};
use crate::error::Result;
use crate::serialize::{deserialize_raw, serialize_raw};

/// One stored entry: the text channel and the raw channel share the map.
#[derive(Debug, Clone, PartialEq)]
enum StoredValue {
    /// Entry written through `set`.
    Text(String),
    /// Entry written through `set_raw`.
    Bytes(Vec<u8>),
}

/// In-memory driver backed by [`DashMap`] for concurrent access.
///
/// Values written through one channel remain readable through the other:
/// a text read of a bytes entry yields the raw envelope, and a raw read
/// of a text entry yields its UTF-8 bytes.
#[derive(Default)]
pub struct MemoryDriver {
    entries: DashMap<String, StoredValue>,
}

impl MemoryDriver {
    /// Creates a new, empty `MemoryDriver`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the driver holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            set: true,
            set_raw: true,
            get_raw: true,
            remove: true,
            clear: true,
            ..Capabilities::default()
        }
    }

    async fn has(&self, key: &str, _opts: &Options) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn get(&self, key: &str, _opts: &Options) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|entry| match entry.value() {
            StoredValue::Text(text) => text.clone(),
            StoredValue::Bytes(bytes) => serialize_raw(bytes),
        }))
    }

    async fn get_raw(&self, key: &str, _opts: &Options) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|entry| match entry.value() {
            StoredValue::Text(text) => deserialize_raw(text),
            StoredValue::Bytes(bytes) => bytes.clone(),
        }))
    }

    async fn set(&self, key: &str, value: String, _opts: &Options) -> Result<()> {
        self.entries.insert(key.to_string(), StoredValue::Text(value));
        Ok(())
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, _opts: &Options) -> Result<()> {
        self.entries.insert(key.to_string(), StoredValue::Bytes(value));
        Ok(())
    }

    async fn remove(&self, key: &str, _opts: &Options) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list_keys(&self, base: &str, _opts: &Options) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(base))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn clear(&self, base: &str, _opts: &Options) -> Result<()> {
        if base.is_empty() {
            self.entries.clear();
        } else {
            self.entries.retain(|key, _| !key.starts_with(base));
        }
        Ok(())
    }
}
