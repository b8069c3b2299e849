//! Driver contract: the interface every storage backend implements.
//!
//! A driver is used as `Arc<dyn Driver>`. The required operation set is
//! `has` / `get` / `list_keys`; everything else is optional. Optional
//! operations have no-op default bodies, and a driver advertises which of
//! them it genuinely implements through its [`Capabilities`] record — the
//! engine consults the record and takes a fallback path instead of calling
//! an unimplemented method. This keeps "operation not supported" out of
//! the error channel entirely.
//!
//! Drivers receive **relative** keys (mount base already stripped) and
//! **text** values (pre-serialized by the engine unless the raw path is
//! taken).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Value;

/// Change notification kinds reported by driver watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// Key was created or its value changed.
    Update,
    /// Key was removed.
    Remove,
}

/// Callback invoked by a driver watcher with `(event, relative key)`.
pub type WatchCallback = Arc<dyn Fn(WatchEvent, &str) + Send + Sync>;

/// Scoped unwatch handle returned by [`Driver::watch`].
///
/// Stopping is idempotent; dropping an unstopped guard also tears the
/// watcher down, so handles cannot leak a live watcher.
pub struct WatchGuard {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchGuard {
    /// Creates a guard that runs `teardown` when stopped or dropped.
    #[must_use]
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// Creates a guard with no teardown work (drivers without watch
    /// support).
    #[must_use]
    pub fn noop() -> Self {
        Self { teardown: None }
    }

    /// Stops the underlying watcher.
    pub fn stop(mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl std::fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchGuard")
            .field("active", &self.teardown.is_some())
            .finish()
    }
}

/// Declares which optional operations a driver genuinely implements.
///
/// The engine never calls an optional operation whose flag is `false`; it
/// takes the documented fallback path instead (silent no-op for mutators,
/// `None`/empty for readers, per-item calls for batches).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Driver implements `set` (text writes).
    pub set: bool,
    /// Driver implements `set_raw` (native byte writes).
    pub set_raw: bool,
    /// Driver implements `get_raw` (native byte reads).
    pub get_raw: bool,
    /// Driver implements `remove`.
    pub remove: bool,
    /// Driver implements `get_meta`.
    pub get_meta: bool,
    /// Driver implements `get_many` as a single batch call.
    pub get_many: bool,
    /// Driver implements `set_many` as a single batch call.
    pub set_many: bool,
    /// Driver implements `clear`.
    pub clear: bool,
    /// Driver implements `watch`.
    pub watch: bool,
    /// Driver has cleanup work in `dispose`.
    pub dispose: bool,
    /// `list_keys` honours a `max_depth` option natively; the engine may
    /// trust pre-filtered results (it still applies its own filter, since
    /// mount prefixes shift depths).
    pub supports_max_depth: bool,
    /// Driver enforces `ttl` itself; the engine treats ttl as advisory
    /// metadata otherwise.
    pub native_ttl: bool,
}

/// Entry metadata. All fields are optional; drivers fill what they know.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    /// Last access time.
    pub atime: Option<SystemTime>,
    /// Last modification time.
    pub mtime: Option<SystemTime>,
    /// Inode/status change time.
    pub ctime: Option<SystemTime>,
    /// Creation time.
    pub birthtime: Option<SystemTime>,
    /// Time-to-live in seconds.
    pub ttl: Option<u64>,
    /// Entry size in bytes.
    pub size: Option<u64>,
    /// Driver-specific fields (e.g. a content hash).
    pub extra: BTreeMap<String, Value>,
}

impl Metadata {
    /// Whether no field is populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.atime.is_none()
            && self.mtime.is_none()
            && self.ctime.is_none()
            && self.birthtime.is_none()
            && self.ttl.is_none()
            && self.size.is_none()
            && self.extra.is_empty()
    }
}

/// Open per-operation options record, passed through to drivers verbatim.
///
/// Well-known entries have typed accessors; drivers may define their own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options(BTreeMap<String, Value>);

impl Options {
    /// Creates an empty options record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an arbitrary entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Sets the `ttl` entry (seconds; honoured on writes).
    #[must_use]
    pub fn with_ttl(self, seconds: u64) -> Self {
        self.with("ttl", seconds as i64)
    }

    /// Sets the `maxDepth` entry (honoured by enumeration).
    #[must_use]
    pub fn with_max_depth(self, depth: usize) -> Self {
        self.with("maxDepth", depth as i64)
    }

    /// Sets the `removeMeta` entry (honoured by remove).
    #[must_use]
    pub fn with_remove_meta(self, remove_meta: bool) -> Self {
        self.with("removeMeta", remove_meta)
    }

    /// Sets the `nativeOnly` entry (honoured by get-meta).
    #[must_use]
    pub fn with_native_only(self, native_only: bool) -> Self {
        self.with("nativeOnly", native_only)
    }

    /// Reads an arbitrary entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The `ttl` entry, if set.
    #[must_use]
    pub fn ttl(&self) -> Option<u64> {
        self.get("ttl").and_then(Value::as_int).map(|n| n.max(0) as u64)
    }

    /// The `maxDepth` entry, if set.
    #[must_use]
    pub fn max_depth(&self) -> Option<usize> {
        self.get("maxDepth")
            .and_then(Value::as_int)
            .map(|n| n.max(0) as usize)
    }

    /// The `removeMeta` entry, defaulting to `false`.
    #[must_use]
    pub fn remove_meta(&self) -> bool {
        self.get("removeMeta").and_then(Value::as_bool).unwrap_or(false)
    }

    /// The `nativeOnly` entry, defaulting to `false`.
    #[must_use]
    pub fn native_only(&self) -> bool {
        self.get("nativeOnly").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Iterates all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// A storage backend.
///
/// Implementations are in-process (memory), filesystem-backed, composite
/// (overlay), or remote (HTTP). Used as `Arc<dyn Driver>`; a driver may be
/// shared by multiple mounts only if it tolerates concurrent use.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short driver name for diagnostics (`"memory"`, `"fs"`, ...).
    fn name(&self) -> &'static str;

    /// The optional-operation record for this driver.
    fn capabilities(&self) -> Capabilities;

    /// Whether the key exists.
    async fn has(&self, key: &str, opts: &Options) -> Result<bool>;

    /// Reads the text value, `None` when absent.
    async fn get(&self, key: &str, opts: &Options) -> Result<Option<String>>;

    /// Enumerates keys under `base` (relative colon form).
    async fn list_keys(&self, base: &str, opts: &Options) -> Result<Vec<String>>;

    /// Reads raw bytes. Only called when `capabilities().get_raw`.
    async fn get_raw(&self, _key: &str, _opts: &Options) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Writes a text value. Only called when `capabilities().set`.
    async fn set(&self, _key: &str, _value: String, _opts: &Options) -> Result<()> {
        Ok(())
    }

    /// Writes raw bytes. Only called when `capabilities().set_raw`.
    async fn set_raw(&self, _key: &str, _value: Vec<u8>, _opts: &Options) -> Result<()> {
        Ok(())
    }

    /// Removes a key. Only called when `capabilities().remove`.
    async fn remove(&self, _key: &str, _opts: &Options) -> Result<()> {
        Ok(())
    }

    /// Reads entry metadata. Only called when `capabilities().get_meta`.
    async fn get_meta(&self, _key: &str, _opts: &Options) -> Result<Option<Metadata>> {
        Ok(None)
    }

    /// Batch read. Only called when `capabilities().get_many`.
    ///
    /// Returns one `(key, value)` pair per requested key, in any order.
    async fn get_many(
        &self,
        _keys: &[String],
        _opts: &Options,
    ) -> Result<Vec<(String, Option<String>)>> {
        Ok(Vec::new())
    }

    /// Batch write. Only called when `capabilities().set_many`.
    async fn set_many(&self, _items: Vec<(String, String)>, _opts: &Options) -> Result<()> {
        Ok(())
    }

    /// Removes every key under `base`. Only called when
    /// `capabilities().clear`.
    async fn clear(&self, _base: &str, _opts: &Options) -> Result<()> {
        Ok(())
    }

    /// Starts change notification, reporting relative keys to `callback`.
    /// Only called when `capabilities().watch`.
    async fn watch(&self, _callback: WatchCallback) -> Result<WatchGuard> {
        Ok(WatchGuard::noop())
    }

    /// Releases backend resources. Called at most once, during engine
    /// disposal or unmount.
    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}
