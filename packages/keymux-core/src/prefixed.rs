//! Namespaced proxy over a storage engine.
//!
//! A [`PrefixedStorage`] rewrites every key on the way in
//! (`k` → `prefix:k`) and strips the prefix on the way out, sharing the
//! underlying engine — including its watch surface. An empty prefix is a
//! pure passthrough.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::driver::{Metadata, Options, WatchCallback};
use crate::engine::{Storage, WatchId};
use crate::error::Result;
use crate::key::{normalize_base_key, normalize_key};
use crate::types::Value;

/// A view of a [`Storage`] engine confined to one key subtree.
#[derive(Clone)]
pub struct PrefixedStorage {
    inner: Arc<Storage>,
    /// Normalized base form: empty, or ending in a single `:`.
    prefix: String,
}

impl Storage {
    /// Returns a view of this engine confined to `prefix`.
    #[must_use]
    pub fn prefixed(self: &Arc<Self>, prefix: &str) -> PrefixedStorage {
        PrefixedStorage {
            inner: Arc::clone(self),
            prefix: normalize_base_key(prefix),
        }
    }
}

impl PrefixedStorage {
    /// The underlying engine.
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.inner
    }

    /// The normalized prefix (empty for a passthrough view).
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn expand(&self, key: &str) -> String {
        format!("{}{}", self.prefix, normalize_key(key))
    }

    fn expand_base(&self, base: &str) -> String {
        format!("{}{}", self.prefix, normalize_base_key(base))
    }

    fn strip<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }

    /// Whether `key` exists in the subtree.
    pub async fn has(&self, key: &str) -> Result<bool> {
        self.inner.has(&self.expand(key)).await
    }

    /// Reads the value at `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(&self.expand(key)).await
    }

    /// Reads raw bytes at `key`.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get_raw(&self.expand(key)).await
    }

    /// Stores `value` at `key`.
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.inner.set(&self.expand(key), value).await
    }

    /// [`set`](Self::set) with explicit options.
    pub async fn set_with(
        &self,
        key: &str,
        value: impl Into<Value>,
        opts: &Options,
    ) -> Result<()> {
        self.inner.set_with(&self.expand(key), value, opts).await
    }

    /// Stores raw bytes at `key`.
    pub async fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.set_raw(&self.expand(key), value).await
    }

    /// Removes `key`.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(&self.expand(key)).await
    }

    /// Reads entry metadata.
    pub async fn get_meta(&self, key: &str) -> Result<Metadata> {
        self.inner.get_meta(&self.expand(key)).await
    }

    /// Enumerates keys under `base`, prefix-stripped.
    pub async fn list_keys(&self, base: &str) -> Result<Vec<String>> {
        self.list_keys_with(base, &Options::new()).await
    }

    /// [`list_keys`](Self::list_keys) with explicit options.
    pub async fn list_keys_with(&self, base: &str, opts: &Options) -> Result<Vec<String>> {
        let keys = self
            .inner
            .list_keys_with(&self.expand_base(base), opts)
            .await?;
        Ok(keys
            .into_iter()
            .map(|key| self.strip(&key).to_string())
            .collect())
    }

    /// Clears the subtree under `base`.
    pub async fn clear(&self, base: &str) -> Result<()> {
        self.inner.clear(&self.expand_base(base)).await
    }

    /// Batch read with prefix rewriting in both directions.
    pub async fn get_many(&self, keys: &[&str]) -> Result<Vec<(String, Option<Value>)>> {
        let expanded: Vec<String> = keys.iter().map(|k| self.expand(k)).collect();
        let borrowed: Vec<&str> = expanded.iter().map(String::as_str).collect();
        let values = self.inner.get_many(&borrowed).await?;
        Ok(values
            .into_iter()
            .map(|(key, value)| (self.strip(&key).to_string(), value))
            .collect())
    }

    /// Batch write with prefix rewriting.
    pub async fn set_many(&self, items: Vec<(String, Value)>) -> Result<()> {
        self.inner
            .set_many(
                items
                    .into_iter()
                    .map(|(key, value)| (self.expand(&key), value))
                    .collect(),
            )
            .await
    }

    /// Subscribes to changes inside the subtree; delivered keys are
    /// prefix-stripped.
    pub async fn watch(&self, callback: WatchCallback) -> Result<WatchId> {
        let prefix = self.prefix.clone();
        let filtered: WatchCallback = Arc::new(move |event, key: &str| {
            if let Some(stripped) = key.strip_prefix(prefix.as_str()) {
                callback(event, stripped);
            }
        });
        self.inner.watch(filtered).await
    }

    /// Drops a subscription created through this view.
    pub async fn unwatch(&self, id: WatchId) {
        self.inner.unwatch(id).await;
    }

    /// Stores caller metadata for `key`.
    pub async fn set_meta(&self, key: &str, meta: BTreeMap<String, Value>) -> Result<()> {
        self.inner.set_meta(&self.expand(key), meta).await
    }
}
