//! Storage engine: mount table, routing, batching, watch fan-in.
//!
//! [`Storage`] multiplexes one logical key namespace across mounted
//! drivers. Each operation normalizes its key, routes it to the mount
//! with the longest matching base, and post-processes the driver's
//! answer (tolerant parsing, raw envelope handling, capability
//! fallbacks).
//!
//! Locking discipline: the mount table and subscriber list sit behind
//! short `parking_lot` critical sections; driver I/O always happens after
//! the lock is released. Watch start/stop is serialized by an async mutex
//! so repeated transitions stay idempotent.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::driver::{
    Driver, Metadata, Options, WatchCallback, WatchEvent, WatchGuard,
};
use crate::error::{Result, StorageError};
use crate::key::{
    filter_key_by_base, filter_key_by_depth, normalize_base_key, normalize_key,
};
use crate::serialize::{deserialize_raw, is_raw_envelope, parse, serialize_raw, stringify};
use crate::types::Value;

/// Bound on snapshot/restore fan-out per call.
const SNAPSHOT_CONCURRENCY: usize = 16;

/// Handle identifying one watch subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct Mount {
    base: String,
    driver: Arc<dyn Driver>,
}

struct MountMatch {
    base: String,
    relative_base: String,
    driver: Arc<dyn Driver>,
}

#[derive(Default)]
struct SubscriberList {
    next_id: u64,
    entries: Vec<(u64, WatchCallback)>,
}

#[derive(Default)]
struct WatchRegistry {
    active: bool,
    guards: Vec<(String, WatchGuard)>,
}

/// The storage façade: one logical namespace over mounted drivers.
///
/// Created with a root driver (in-memory by default); additional drivers
/// are mounted under non-empty bases at any time. Used as
/// `Arc<Storage>` so watch closures and prefixed views can share it.
pub struct Storage {
    mounts: RwLock<Vec<Mount>>,
    subscribers: Arc<RwLock<SubscriberList>>,
    watch_registry: Mutex<WatchRegistry>,
}

impl Storage {
    /// Creates a storage engine rooted on an in-memory driver.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(Arc::new(crate::drivers::MemoryDriver::new()))
    }

    /// Creates a storage engine rooted on `driver`.
    #[must_use]
    pub fn with_root(driver: Arc<dyn Driver>) -> Self {
        Self {
            mounts: RwLock::new(vec![Mount {
                base: String::new(),
                driver,
            }]),
            subscribers: Arc::new(RwLock::new(SubscriberList::default())),
            watch_registry: Mutex::new(WatchRegistry::default()),
        }
    }

    // ── Routing ───────────────────────────────────────────────────────

    /// Longest-prefix mount match. The mount list is sorted by descending
    /// base length, so the first hit wins; the root mount matches
    /// everything.
    fn route(&self, key: &str) -> (String, String, Arc<dyn Driver>) {
        let mounts = self.mounts.read();
        let mount = mounts
            .iter()
            .find(|m| key.starts_with(&m.base))
            .expect("root mount always matches");
        (
            mount.base.clone(),
            key[mount.base.len()..].to_string(),
            Arc::clone(&mount.driver),
        )
    }

    /// Mounts relevant to a subtree: every mount under `base`, plus
    /// (optionally) the ancestor mounts owning it. Ancestor matches carry
    /// the base relative to their own mount point.
    fn mounts_for(&self, base: &str, include_ancestors: bool) -> Vec<MountMatch> {
        let mounts = self.mounts.read();
        mounts
            .iter()
            .filter(|m| {
                m.base.starts_with(base) || (include_ancestors && base.starts_with(&m.base))
            })
            .map(|m| MountMatch {
                base: m.base.clone(),
                relative_base: if base.len() > m.base.len() {
                    base[m.base.len()..].to_string()
                } else {
                    String::new()
                },
                driver: Arc::clone(&m.driver),
            })
            .collect()
    }

    /// Mount bases in routing order (descending length, root last).
    #[must_use]
    pub fn mount_bases(&self) -> Vec<String> {
        self.mounts.read().iter().map(|m| m.base.clone()).collect()
    }

    // ── Single-key operations ─────────────────────────────────────────

    /// Whether `key` exists.
    pub async fn has(&self, key: &str) -> Result<bool> {
        self.has_with(key, &Options::new()).await
    }

    /// [`has`](Self::has) with explicit options.
    pub async fn has_with(&self, key: &str, opts: &Options) -> Result<bool> {
        let key = normalize_key(key);
        let (_, relative, driver) = self.route(&key);
        driver.has(&relative, opts).await
    }

    /// Reads and tolerantly parses the value at `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.get_with(key, &Options::new()).await
    }

    /// [`get`](Self::get) with explicit options.
    pub async fn get_with(&self, key: &str, opts: &Options) -> Result<Option<Value>> {
        let key = normalize_key(key);
        let (_, relative, driver) = self.route(&key);
        Ok(driver.get(&relative, opts).await?.map(|text| parse(&text)))
    }

    /// Reads raw bytes at `key`, falling back to the text channel when
    /// the driver has no native raw read.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.get_raw_with(key, &Options::new()).await
    }

    /// [`get_raw`](Self::get_raw) with explicit options.
    pub async fn get_raw_with(&self, key: &str, opts: &Options) -> Result<Option<Vec<u8>>> {
        let key = normalize_key(key);
        let (_, relative, driver) = self.route(&key);
        if driver.capabilities().get_raw {
            driver.get_raw(&relative, opts).await
        } else {
            Ok(driver
                .get(&relative, opts)
                .await?
                .map(|text| deserialize_raw(&text)))
        }
    }

    /// Stores `value` at `key`.
    ///
    /// Bytes take the raw path (native when offered, text envelope
    /// otherwise); every other variant is stringified. A driver without
    /// write support makes this a silent no-op.
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.set_with(key, value, &Options::new()).await
    }

    /// [`set`](Self::set) with explicit options (e.g. `ttl`).
    pub async fn set_with(
        &self,
        key: &str,
        value: impl Into<Value>,
        opts: &Options,
    ) -> Result<()> {
        let key = normalize_key(key);
        let (_, relative, driver) = self.route(&key);
        let caps = driver.capabilities();

        match value.into() {
            Value::Bytes(bytes) => {
                if caps.set_raw {
                    driver.set_raw(&relative, bytes, opts).await?;
                } else if caps.set {
                    driver.set(&relative, serialize_raw(&bytes), opts).await?;
                } else {
                    return Ok(());
                }
            }
            value => {
                let text = stringify(&value)?;
                if caps.set {
                    driver.set(&relative, text, opts).await?;
                } else if caps.set_raw {
                    driver.set_raw(&relative, text.into_bytes(), opts).await?;
                } else {
                    return Ok(());
                }
            }
        }
        if !caps.watch {
            self.emit(WatchEvent::Update, &key);
        }
        Ok(())
    }

    /// Stores raw bytes at `key`.
    pub async fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.set_raw_with(key, value, &Options::new()).await
    }

    /// [`set_raw`](Self::set_raw) with explicit options.
    pub async fn set_raw_with(&self, key: &str, value: Vec<u8>, opts: &Options) -> Result<()> {
        self.set_with(key, Value::Bytes(value), opts).await
    }

    /// Removes `key`. Drivers without remove support make this a silent
    /// no-op.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.remove_with(key, &Options::new()).await
    }

    /// [`remove`](Self::remove) with explicit options (`removeMeta`
    /// also drops the `key$` metadata entry).
    pub async fn remove_with(&self, key: &str, opts: &Options) -> Result<()> {
        let key = normalize_key(key);
        let (_, relative, driver) = self.route(&key);
        let caps = driver.capabilities();
        if !caps.remove {
            return Ok(());
        }
        driver.remove(&relative, opts).await?;
        if opts.remove_meta() {
            driver.remove(&format!("{relative}$"), opts).await?;
        }
        if !caps.watch {
            self.emit(WatchEvent::Remove, &key);
        }
        Ok(())
    }

    /// Reads entry metadata: the driver's native record (when supported)
    /// merged with any stored `key$` metadata entry, unless `nativeOnly`.
    pub async fn get_meta(&self, key: &str) -> Result<Metadata> {
        self.get_meta_with(key, &Options::new()).await
    }

    /// [`get_meta`](Self::get_meta) with explicit options.
    pub async fn get_meta_with(&self, key: &str, opts: &Options) -> Result<Metadata> {
        let key = normalize_key(key);
        let (_, relative, driver) = self.route(&key);
        let caps = driver.capabilities();

        let mut meta = if caps.get_meta {
            driver.get_meta(&relative, opts).await?.unwrap_or_default()
        } else {
            Metadata::default()
        };

        if !opts.native_only() {
            if let Some(text) = driver.get(&format!("{relative}$"), opts).await? {
                if let Value::Map(stored) = parse(&text) {
                    for (field, value) in stored {
                        if field == "ttl" {
                            meta.ttl = value.as_int().map(|n| n.max(0) as u64);
                        } else {
                            meta.extra.insert(field, value);
                        }
                    }
                }
            }
        }
        Ok(meta)
    }

    /// Stores caller metadata under the reserved `key$` entry.
    pub async fn set_meta(&self, key: &str, meta: BTreeMap<String, Value>) -> Result<()> {
        self.set(&format!("{}$", normalize_key(key)), Value::Map(meta))
            .await
    }

    // ── Enumeration & clearing ────────────────────────────────────────

    /// Enumerates keys under `base` across every relevant mount.
    ///
    /// A failing mount contributes nothing rather than poisoning the
    /// whole view. Metadata-reserved keys are excluded; keys reported by
    /// an ancestor mount but owned by a longer mounted base are masked so
    /// enumeration agrees with routing.
    pub async fn list_keys(&self, base: &str) -> Result<Vec<String>> {
        self.list_keys_with(base, &Options::new()).await
    }

    /// [`list_keys`](Self::list_keys) with explicit options
    /// (`maxDepth` limits results to that many separator levels).
    pub async fn list_keys_with(&self, base: &str, opts: &Options) -> Result<Vec<String>> {
        let base = normalize_base_key(base);
        let mounts = self.mounts_for(&base, true);

        let mut found: BTreeSet<String> = BTreeSet::new();
        let mut masked: Vec<String> = Vec::new();
        for mount in mounts {
            match mount.driver.list_keys(&mount.relative_base, opts).await {
                Ok(keys) => {
                    for key in keys {
                        let full = format!("{}{}", mount.base, normalize_key(&key));
                        if !masked.iter().any(|m| full.starts_with(m.as_str())) {
                            found.insert(full);
                        }
                    }
                }
                Err(err) => {
                    warn!(mount = %mount.base, %err, "list_keys failed for mount; skipping");
                }
            }
            if !mount.base.is_empty() {
                masked.push(mount.base);
            }
        }

        let max_depth = opts.max_depth();
        Ok(found
            .into_iter()
            .filter(|key| filter_key_by_depth(key, max_depth) && filter_key_by_base(key, &base))
            .collect())
    }

    /// Clears the subtree under `base` on every mount that supports it,
    /// ancestors included (the owning driver may hold data under the
    /// base). Per-mount failures are logged, never raised.
    pub async fn clear(&self, base: &str) -> Result<()> {
        self.clear_with(base, &Options::new()).await
    }

    /// [`clear`](Self::clear) with explicit options.
    pub async fn clear_with(&self, base: &str, opts: &Options) -> Result<()> {
        let base = normalize_base_key(base);
        let mounts = self.mounts_for(&base, true);
        let results = join_all(mounts.iter().filter(|m| m.driver.capabilities().clear).map(
            |mount| {
                let relative = mount.relative_base.clone();
                let driver = Arc::clone(&mount.driver);
                async move { (mount.base.clone(), driver.clear(&relative, opts).await) }
            },
        ))
        .await;
        for (mount_base, result) in results {
            if let Err(err) = result {
                warn!(mount = %mount_base, %err, "clear failed for mount; continuing");
            }
        }
        Ok(())
    }

    // ── Batching ──────────────────────────────────────────────────────

    /// Reads many keys, one batch call per driver that supports it and
    /// parallel singletons otherwise. Results come back in input order.
    pub async fn get_many(&self, keys: &[&str]) -> Result<Vec<(String, Option<Value>)>> {
        self.get_many_with(keys, &Options::new()).await
    }

    /// [`get_many`](Self::get_many) with explicit options.
    pub async fn get_many_with(
        &self,
        keys: &[&str],
        opts: &Options,
    ) -> Result<Vec<(String, Option<Value>)>> {
        let normalized: Vec<String> = keys.iter().map(|k| normalize_key(k)).collect();

        // One batch per resolved mount, preserving per-batch key order.
        let mut batches: HashMap<String, (Arc<dyn Driver>, Vec<(String, String)>)> =
            HashMap::new();
        for key in &normalized {
            let (base, relative, driver) = self.route(key);
            batches
                .entry(base)
                .or_insert_with(|| (driver, Vec::new()))
                .1
                .push((key.clone(), relative));
        }

        let mut resolved: HashMap<String, Option<Value>> = HashMap::new();
        for (base, (driver, items)) in batches {
            if driver.capabilities().get_many {
                let relative_keys: Vec<String> =
                    items.iter().map(|(_, rel)| rel.clone()).collect();
                for (relative, text) in driver.get_many(&relative_keys, opts).await? {
                    let full = format!("{}{}", base, normalize_key(&relative));
                    resolved.insert(full, text.map(|t| parse(&t)));
                }
            } else {
                let reads = join_all(items.iter().map(|(_, relative)| {
                    let driver = Arc::clone(&driver);
                    async move { driver.get(relative, opts).await }
                }))
                .await;
                for ((full, _), text) in items.into_iter().zip(reads) {
                    resolved.insert(full, text?.map(|t| parse(&t)));
                }
            }
        }

        Ok(normalized
            .into_iter()
            .map(|key| {
                let value = resolved.get(&key).cloned().flatten();
                (key, value)
            })
            .collect())
    }

    /// Writes many entries, one batch call per driver that supports it
    /// and parallel singletons otherwise. Never issues both the batch op
    /// and per-item ops to the same driver.
    pub async fn set_many(&self, items: Vec<(String, Value)>) -> Result<()> {
        self.set_many_with(items, &Options::new()).await
    }

    /// [`set_many`](Self::set_many) with explicit options.
    pub async fn set_many_with(&self, items: Vec<(String, Value)>, opts: &Options) -> Result<()> {
        let mut batches: HashMap<String, (Arc<dyn Driver>, Vec<(String, String, String)>)> =
            HashMap::new();
        for (key, value) in items {
            let key = normalize_key(&key);
            let text = stringify(&value)?;
            let (base, relative, driver) = self.route(&key);
            batches
                .entry(base)
                .or_insert_with(|| (driver, Vec::new()))
                .1
                .push((key, relative, text));
        }

        for (_, (driver, items)) in batches {
            let caps = driver.capabilities();
            if caps.set_many {
                let batch: Vec<(String, String)> = items
                    .iter()
                    .map(|(_, relative, text)| (relative.clone(), text.clone()))
                    .collect();
                driver.set_many(batch, opts).await?;
            } else if caps.set {
                let writes = join_all(items.iter().map(|(_, relative, text)| {
                    let driver = Arc::clone(&driver);
                    let text = text.clone();
                    async move { driver.set(relative, text, opts).await }
                }))
                .await;
                for result in writes {
                    result?;
                }
            } else {
                continue;
            }
            if !caps.watch {
                for (key, _, _) in &items {
                    self.emit(WatchEvent::Update, key);
                }
            }
        }
        Ok(())
    }

    // ── Mounting ──────────────────────────────────────────────────────

    /// Mounts `driver` under `base`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] when the normalized base is
    /// empty (the root mount is fixed) or already mounted.
    pub async fn mount(&self, base: &str, driver: Arc<dyn Driver>) -> Result<()> {
        let base = normalize_base_key(base);
        if base.is_empty() {
            return Err(StorageError::InvalidKey(
                "cannot mount over the root; the engine owns the empty base".to_string(),
            ));
        }
        {
            let mut mounts = self.mounts.write();
            if mounts.iter().any(|m| m.base == base) {
                return Err(StorageError::InvalidKey(format!(
                    "base already mounted: {base}"
                )));
            }
            mounts.push(Mount {
                base: base.clone(),
                driver: Arc::clone(&driver),
            });
            mounts.sort_by(|a, b| b.base.len().cmp(&a.base.len()));
        }
        debug!(%base, driver = driver.name(), "mounted driver");

        // Extend an active watch session to the new mount.
        let mut registry = self.watch_registry.lock().await;
        if registry.active && driver.capabilities().watch {
            match driver.watch(self.forwarder(&base)).await {
                Ok(guard) => registry.guards.push((base, guard)),
                Err(err) => warn!(%err, "watch failed for newly mounted driver"),
            }
        }
        Ok(())
    }

    /// Unmounts `base`, tearing down its watch and, when `dispose` is
    /// set, disposing the driver. Unknown bases are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] for the root base.
    pub async fn unmount(&self, base: &str, dispose: bool) -> Result<()> {
        let base = normalize_base_key(base);
        if base.is_empty() {
            return Err(StorageError::InvalidKey(
                "cannot unmount the root mount".to_string(),
            ));
        }
        let removed = {
            let mut mounts = self.mounts.write();
            match mounts.iter().position(|m| m.base == base) {
                Some(index) => Some(mounts.remove(index)),
                None => None,
            }
        };
        let Some(mount) = removed else {
            return Ok(());
        };

        {
            let mut registry = self.watch_registry.lock().await;
            if let Some(index) = registry.guards.iter().position(|(b, _)| *b == base) {
                let (_, guard) = registry.guards.remove(index);
                guard.stop();
            }
        }

        if dispose {
            if let Err(err) = mount.driver.dispose().await {
                warn!(%base, %err, "driver dispose failed during unmount");
            }
        }
        Ok(())
    }

    // ── Watching ──────────────────────────────────────────────────────

    /// Subscribes `callback` to change events across all mounts.
    ///
    /// The first subscriber starts every mounted driver's watcher; keys
    /// delivered to callbacks are absolute (mount base prepended).
    pub async fn watch(&self, callback: WatchCallback) -> Result<WatchId> {
        let (id, first) = {
            let mut subs = self.subscribers.write();
            subs.next_id += 1;
            let id = subs.next_id;
            subs.entries.push((id, callback));
            (id, subs.entries.len() == 1)
        };
        if first {
            self.start_watching().await;
        }
        Ok(WatchId(id))
    }

    /// Drops one subscription; the last one stops every driver watcher.
    pub async fn unwatch(&self, id: WatchId) {
        let empty = {
            let mut subs = self.subscribers.write();
            subs.entries.retain(|(entry_id, _)| *entry_id != id.0);
            subs.entries.is_empty()
        };
        if empty {
            self.stop_watching().await;
        }
    }

    /// Drops every subscription and stops all driver watchers.
    pub async fn unwatch_all(&self) {
        self.subscribers.write().entries.clear();
        self.stop_watching().await;
    }

    /// Builds the per-mount forwarding callback: prepends the mount base
    /// and fans the event out to every subscriber.
    fn forwarder(&self, base: &str) -> WatchCallback {
        let subscribers = Arc::clone(&self.subscribers);
        let base = base.to_string();
        Arc::new(move |event, relative_key: &str| {
            let absolute = format!("{}{}", base, normalize_key(relative_key));
            let callbacks: Vec<WatchCallback> = subscribers
                .read()
                .entries
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            for callback in callbacks {
                callback(event, &absolute);
            }
        })
    }

    /// Synthesizes an event for mutations through the façade on drivers
    /// without native watch support.
    fn emit(&self, event: WatchEvent, key: &str) {
        let callbacks: Vec<WatchCallback> = self
            .subscribers
            .read()
            .entries
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(event, key);
        }
    }

    async fn start_watching(&self) {
        let mut registry = self.watch_registry.lock().await;
        if registry.active {
            return;
        }
        let targets: Vec<(String, Arc<dyn Driver>)> = self
            .mounts
            .read()
            .iter()
            .filter(|m| m.driver.capabilities().watch)
            .map(|m| (m.base.clone(), Arc::clone(&m.driver)))
            .collect();
        for (base, driver) in targets {
            match driver.watch(self.forwarder(&base)).await {
                Ok(guard) => registry.guards.push((base, guard)),
                Err(err) => {
                    warn!(mount = %base, %err, "driver watch failed; continuing without it");
                }
            }
        }
        registry.active = true;
    }

    async fn stop_watching(&self) {
        let mut registry = self.watch_registry.lock().await;
        if !registry.active {
            return;
        }
        for (_, guard) in registry.guards.drain(..) {
            guard.stop();
        }
        registry.active = false;
    }

    // ── Snapshot / restore ────────────────────────────────────────────

    /// Captures every entry under `base` as a map from base-relative key
    /// to text (raw envelope for binary payloads).
    pub async fn snapshot(&self, base: &str) -> Result<BTreeMap<String, String>> {
        let base = normalize_base_key(base);
        let keys = self.list_keys(&base).await?;
        let semaphore = Arc::new(Semaphore::new(SNAPSHOT_CONCURRENCY));

        let entries = join_all(keys.into_iter().map(|key| {
            let semaphore = Arc::clone(&semaphore);
            let relative = key[base.len()..].to_string();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let bytes = self.get_raw(&key).await?;
                Ok::<_, StorageError>((relative, bytes))
            }
        }))
        .await;

        let mut snapshot = BTreeMap::new();
        for entry in entries {
            let (relative, bytes) = entry?;
            let Some(bytes) = bytes else { continue };
            // UTF-8 payloads are stored as plain text, except when the
            // text collides with the envelope tag: restore would decode
            // it into different bytes, so wrap it like binary data.
            let text = match String::from_utf8(bytes) {
                Ok(text) if !is_raw_envelope(&text) => text,
                Ok(text) => serialize_raw(text.as_bytes()),
                Err(not_utf8) => serialize_raw(not_utf8.as_bytes()),
            };
            snapshot.insert(relative, text);
        }
        Ok(snapshot)
    }

    /// Writes a snapshot back under `base`.
    pub async fn restore_snapshot(
        &self,
        base: &str,
        snapshot: BTreeMap<String, String>,
    ) -> Result<()> {
        let base = normalize_base_key(base);
        let semaphore = Arc::new(Semaphore::new(SNAPSHOT_CONCURRENCY));
        let writes = join_all(snapshot.into_iter().map(|(relative, text)| {
            let semaphore = Arc::clone(&semaphore);
            let key = format!("{base}{relative}");
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                self.set(&key, Value::String(text)).await
            }
        }))
        .await;
        for result in writes {
            result?;
        }
        Ok(())
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Stops watches, disposes every mounted driver (best effort), and
    /// resets to a fresh in-memory root.
    pub async fn dispose(&self) {
        self.unwatch_all().await;
        let mounts = {
            let mut table = self.mounts.write();
            std::mem::replace(
                &mut *table,
                vec![Mount {
                    base: String::new(),
                    driver: Arc::new(crate::drivers::MemoryDriver::new()),
                }],
            )
        };
        for mount in mounts {
            if let Err(err) = mount.driver.dispose().await {
                warn!(mount = %mount.base, %err, "driver dispose failed");
            }
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::driver::Capabilities;
    use crate::drivers::MemoryDriver;

    // ── Test drivers ──────────────────────────────────────────────────

    /// Counts batch vs singleton writes to pin down the double-write
    /// guard.
    #[derive(Default)]
    struct CountingDriver {
        inner: MemoryDriver,
        set_calls: AtomicUsize,
        set_many_calls: AtomicUsize,
        get_calls: AtomicUsize,
        get_many_calls: AtomicUsize,
    }

    #[async_trait]
    impl Driver for CountingDriver {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                set: true,
                set_many: true,
                get_many: true,
                remove: true,
                ..Capabilities::default()
            }
        }

        async fn has(&self, key: &str, opts: &Options) -> Result<bool> {
            self.inner.has(key, opts).await
        }

        async fn get(&self, key: &str, opts: &Options) -> Result<Option<String>> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key, opts).await
        }

        async fn list_keys(&self, base: &str, opts: &Options) -> Result<Vec<String>> {
            self.inner.list_keys(base, opts).await
        }

        async fn set(&self, key: &str, value: String, opts: &Options) -> Result<()> {
            self.set_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value, opts).await
        }

        async fn set_many(&self, items: Vec<(String, String)>, opts: &Options) -> Result<()> {
            self.set_many_calls.fetch_add(1, Ordering::SeqCst);
            for (key, value) in items {
                self.inner.set(&key, value, opts).await?;
            }
            Ok(())
        }

        async fn get_many(
            &self,
            keys: &[String],
            opts: &Options,
        ) -> Result<Vec<(String, Option<String>)>> {
            self.get_many_calls.fetch_add(1, Ordering::SeqCst);
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                out.push((key.clone(), self.inner.get(key, opts).await?));
            }
            Ok(out)
        }
    }

    /// Driver with a manually triggerable watcher.
    #[derive(Default)]
    struct WatchableDriver {
        inner: MemoryDriver,
        watcher: StdMutex<Option<WatchCallback>>,
    }

    impl WatchableDriver {
        fn fire(&self, event: WatchEvent, relative_key: &str) {
            if let Some(callback) = self.watcher.lock().unwrap().clone() {
                callback(event, relative_key);
            }
        }
    }

    #[async_trait]
    impl Driver for WatchableDriver {
        fn name(&self) -> &'static str {
            "watchable"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                set: true,
                remove: true,
                watch: true,
                ..Capabilities::default()
            }
        }

        async fn has(&self, key: &str, opts: &Options) -> Result<bool> {
            self.inner.has(key, opts).await
        }

        async fn get(&self, key: &str, opts: &Options) -> Result<Option<String>> {
            self.inner.get(key, opts).await
        }

        async fn list_keys(&self, base: &str, opts: &Options) -> Result<Vec<String>> {
            self.inner.list_keys(base, opts).await
        }

        async fn set(&self, key: &str, value: String, opts: &Options) -> Result<()> {
            self.inner.set(key, value, opts).await
        }

        async fn watch(&self, callback: WatchCallback) -> Result<WatchGuard> {
            *self.watcher.lock().unwrap() = Some(callback);
            Ok(WatchGuard::noop())
        }
    }

    /// Driver whose reads and listings always fail.
    struct FailingDriver;

    #[async_trait]
    impl Driver for FailingDriver {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                clear: true,
                ..Capabilities::default()
            }
        }

        async fn has(&self, _key: &str, _opts: &Options) -> Result<bool> {
            Err(StorageError::Backend(anyhow::anyhow!("backend down")))
        }

        async fn get(&self, _key: &str, _opts: &Options) -> Result<Option<String>> {
            Err(StorageError::Backend(anyhow::anyhow!("backend down")))
        }

        async fn list_keys(&self, _base: &str, _opts: &Options) -> Result<Vec<String>> {
            Err(StorageError::Backend(anyhow::anyhow!("backend down")))
        }

        async fn clear(&self, _base: &str, _opts: &Options) -> Result<()> {
            Err(StorageError::Backend(anyhow::anyhow!("backend down")))
        }
    }

    // ── Routing & mounting ────────────────────────────────────────────

    #[tokio::test]
    async fn prefix_dispatch_end_to_end() {
        let storage = Storage::new();
        storage
            .mount("mnt:", Arc::new(MemoryDriver::new()))
            .await
            .unwrap();

        storage.set("mnt:x", "v1").await.unwrap();
        storage.set("y", "v2").await.unwrap();

        let mut keys = storage.list_keys("").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["mnt:x", "y"]);

        storage.unmount("mnt:", true).await.unwrap();
        assert!(storage.get("mnt:x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn route_picks_longest_matching_base() {
        let storage = Storage::new();
        let outer = Arc::new(MemoryDriver::new());
        let inner = Arc::new(MemoryDriver::new());
        storage.mount("a:", Arc::clone(&outer) as Arc<dyn Driver>).await.unwrap();
        storage.mount("a:b:", Arc::clone(&inner) as Arc<dyn Driver>).await.unwrap();

        storage.set("a:b:c", "deep").await.unwrap();
        storage.set("a:x", "shallow").await.unwrap();

        assert_eq!(
            inner.get("c", &Options::new()).await.unwrap(),
            Some("deep".to_string())
        );
        assert_eq!(
            outer.get("x", &Options::new()).await.unwrap(),
            Some("shallow".to_string())
        );
    }

    #[tokio::test]
    async fn mount_list_stays_sorted_by_descending_length() {
        let storage = Storage::new();
        for base in ["a:", "long:base:", "mid:b:"] {
            storage
                .mount(base, Arc::new(MemoryDriver::new()))
                .await
                .unwrap();
        }
        let bases = storage.mount_bases();
        for window in bases.windows(2) {
            assert!(
                window[0].len() >= window[1].len(),
                "mount list out of order: {bases:?}"
            );
        }
        assert_eq!(bases.last().map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn mount_rejects_duplicate_and_empty_bases() {
        let storage = Storage::new();
        storage
            .mount("dup:", Arc::new(MemoryDriver::new()))
            .await
            .unwrap();

        let err = storage
            .mount("dup", Arc::new(MemoryDriver::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));

        let err = storage
            .mount("", Arc::new(MemoryDriver::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn unmount_root_is_forbidden_and_unknown_is_noop() {
        let storage = Storage::new();
        assert!(storage.unmount("", true).await.is_err());
        storage.unmount("ghost:", true).await.unwrap();
    }

    // ── Values & serialization ────────────────────────────────────────

    #[tokio::test]
    async fn values_round_trip_through_tolerant_parsing() {
        let storage = Storage::new();

        storage.set("s", "plain text").await.unwrap();
        storage.set("n", 8080i64).await.unwrap();
        storage.set("b", true).await.unwrap();
        storage
            .set("o", Value::from_json(serde_json::json!({"n": 1})))
            .await
            .unwrap();

        assert_eq!(
            storage.get("s").await.unwrap(),
            Some(Value::String("plain text".into()))
        );
        assert_eq!(storage.get("n").await.unwrap(), Some(Value::Int(8080)));
        assert_eq!(storage.get("b").await.unwrap(), Some(Value::Bool(true)));
        let Some(Value::Map(map)) = storage.get("o").await.unwrap() else {
            panic!("expected map");
        };
        assert_eq!(map.get("n"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn raw_bytes_round_trip_through_any_driver() {
        let storage = Storage::new();
        let payload = vec![7u8, 0, 255, 13];

        storage.set_raw("blob", payload.clone()).await.unwrap();
        assert_eq!(storage.get_raw("blob").await.unwrap(), Some(payload));
    }

    #[tokio::test]
    async fn raw_fallback_uses_text_envelope() {
        // CountingDriver has no raw capabilities, so the engine must fall
        // back to the text channel with the envelope.
        let driver = Arc::new(CountingDriver::default());
        let storage = Storage::with_root(Arc::clone(&driver) as Arc<dyn Driver>);
        let payload = vec![1u8, 2, 250];

        storage.set_raw("blob", payload.clone()).await.unwrap();
        assert_eq!(storage.get_raw("blob").await.unwrap(), Some(payload));

        let stored = driver.inner.get("blob", &Options::new()).await.unwrap();
        assert!(stored.unwrap().starts_with("raw:3:"));
    }

    #[tokio::test]
    async fn keys_are_normalized_at_the_facade() {
        let storage = Storage::new();
        storage.set("users/42/profile", "alice").await.unwrap();
        assert_eq!(
            storage.get("users:42:profile").await.unwrap(),
            Some(Value::String("alice".into()))
        );
        assert!(storage.has("users:42:profile?cache=no").await.unwrap());
    }

    // ── Enumeration ───────────────────────────────────────────────────

    #[tokio::test]
    async fn list_keys_applies_depth_filter() {
        let storage = Storage::new();
        for key in ["a", "a:b", "a:b:c", "a:b:c:d"] {
            storage.set(key, "x").await.unwrap();
        }
        let mut keys = storage
            .list_keys_with("", &Options::new().with_max_depth(1))
            .await
            .unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "a:b"]);
    }

    #[tokio::test]
    async fn list_keys_excludes_meta_keys() {
        let storage = Storage::new();
        storage.set("k", "v").await.unwrap();
        storage
            .set_meta("k", BTreeMap::from([("ttl".to_string(), Value::Int(60))]))
            .await
            .unwrap();

        let keys = storage.list_keys("").await.unwrap();
        assert_eq!(keys, vec!["k"]);
    }

    #[tokio::test]
    async fn list_keys_swallows_failing_mounts() {
        let storage = Storage::new();
        storage.set("ok", "1").await.unwrap();
        storage
            .mount("bad:", Arc::new(FailingDriver))
            .await
            .unwrap();

        let keys = storage.list_keys("").await.unwrap();
        assert_eq!(keys, vec!["ok"]);
    }

    #[tokio::test]
    async fn list_keys_inside_a_mounted_base() {
        let storage = Storage::new();
        storage
            .mount("mnt:", Arc::new(MemoryDriver::new()))
            .await
            .unwrap();
        storage.set("mnt:sub:one", "1").await.unwrap();
        storage.set("mnt:sub:two", "2").await.unwrap();
        storage.set("mnt:other", "3").await.unwrap();

        let mut keys = storage.list_keys("mnt:sub:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["mnt:sub:one", "mnt:sub:two"]);
    }

    #[tokio::test]
    async fn list_keys_masks_shadowed_ancestor_keys() {
        let root = Arc::new(MemoryDriver::new());
        root.set("mnt:stale", "left behind".to_string(), &Options::new())
            .await
            .unwrap();
        let storage = Storage::with_root(Arc::clone(&root) as Arc<dyn Driver>);
        storage
            .mount("mnt:", Arc::new(MemoryDriver::new()))
            .await
            .unwrap();
        storage.set("mnt:fresh", "new").await.unwrap();

        let keys = storage.list_keys("").await.unwrap();
        assert_eq!(keys, vec!["mnt:fresh"], "root's shadowed key must be masked");
    }

    // ── Clear ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn clear_reaches_descendants_and_ancestors() {
        let root = Arc::new(MemoryDriver::new());
        let storage = Storage::with_root(Arc::clone(&root) as Arc<dyn Driver>);
        storage
            .mount("mnt:", Arc::new(MemoryDriver::new()))
            .await
            .unwrap();

        storage.set("mnt:inside", "1").await.unwrap();
        // Data the root driver holds under the mounted base, unreachable
        // through routing but still cleared.
        root.set("mnt:stale", "2".to_string(), &Options::new())
            .await
            .unwrap();
        storage.set("outside", "3").await.unwrap();

        storage.clear("mnt:").await.unwrap();

        assert!(storage.list_keys("mnt:").await.unwrap().is_empty());
        assert!(!root.has("mnt:stale", &Options::new()).await.unwrap());
        assert!(storage.has("outside").await.unwrap());
    }

    #[tokio::test]
    async fn clear_survives_failing_mounts() {
        let storage = Storage::new();
        storage.set("keep:going", "1").await.unwrap();
        storage
            .mount("bad:", Arc::new(FailingDriver))
            .await
            .unwrap();

        storage.clear("").await.unwrap();
        assert!(storage.list_keys("keep:").await.unwrap().is_empty());
    }

    // ── Batching ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn set_many_issues_exactly_one_batch_call() {
        let driver = Arc::new(CountingDriver::default());
        let storage = Storage::with_root(Arc::clone(&driver) as Arc<dyn Driver>);

        storage
            .set_many(vec![("k".to_string(), Value::String("v".into()))])
            .await
            .unwrap();

        assert_eq!(driver.set_many_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            driver.set_calls.load(Ordering::SeqCst),
            0,
            "batch path must not also issue per-item writes"
        );
    }

    #[tokio::test]
    async fn get_many_prefers_the_batch_call() {
        let driver = Arc::new(CountingDriver::default());
        let storage = Storage::with_root(Arc::clone(&driver) as Arc<dyn Driver>);
        storage.set("a", "1").await.unwrap();
        storage.set("b", "2").await.unwrap();

        driver.get_calls.store(0, Ordering::SeqCst);
        let values = storage.get_many(&["a", "b", "missing"]).await.unwrap();

        assert_eq!(driver.get_many_calls.load(Ordering::SeqCst), 1);
        assert_eq!(driver.get_calls.load(Ordering::SeqCst), 0);
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], ("a".to_string(), Some(Value::Int(1))));
        assert_eq!(values[1], ("b".to_string(), Some(Value::Int(2))));
        assert_eq!(values[2], ("missing".to_string(), None));
    }

    #[tokio::test]
    async fn batches_group_by_mount() {
        let batching = Arc::new(CountingDriver::default());
        let storage = Storage::new();
        storage
            .mount("batch:", Arc::clone(&batching) as Arc<dyn Driver>)
            .await
            .unwrap();

        storage
            .set_many(vec![
                ("batch:a".to_string(), Value::Int(1)),
                ("plain".to_string(), Value::Int(2)),
                ("batch:b".to_string(), Value::Int(3)),
            ])
            .await
            .unwrap();

        assert_eq!(batching.set_many_calls.load(Ordering::SeqCst), 1);
        assert_eq!(storage.get("plain").await.unwrap(), Some(Value::Int(2)));
        assert_eq!(storage.get("batch:a").await.unwrap(), Some(Value::Int(1)));
        assert_eq!(storage.get("batch:b").await.unwrap(), Some(Value::Int(3)));
    }

    // ── Watch fan-in ──────────────────────────────────────────────────

    fn collector() -> (WatchCallback, Arc<StdMutex<Vec<(WatchEvent, String)>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: WatchCallback = Arc::new(move |event, key: &str| {
            sink.lock().unwrap().push((event, key.to_string()));
        });
        (callback, events)
    }

    #[tokio::test]
    async fn driver_events_reach_subscribers_with_absolute_keys() {
        let driver = Arc::new(WatchableDriver::default());
        let storage = Storage::new();
        storage
            .mount("mnt:", Arc::clone(&driver) as Arc<dyn Driver>)
            .await
            .unwrap();

        let (callback, events) = collector();
        let id = storage.watch(callback).await.unwrap();

        driver.fire(WatchEvent::Update, "x");
        driver.fire(WatchEvent::Remove, "sub:y");

        {
            let events = events.lock().unwrap();
            assert_eq!(
                *events,
                vec![
                    (WatchEvent::Update, "mnt:x".to_string()),
                    (WatchEvent::Remove, "mnt:sub:y".to_string()),
                ]
            );
        }
        storage.unwatch(id).await;
    }

    #[tokio::test]
    async fn each_subscriber_sees_each_event_once() {
        let driver = Arc::new(WatchableDriver::default());
        let storage = Storage::new();
        storage
            .mount("m:", Arc::clone(&driver) as Arc<dyn Driver>)
            .await
            .unwrap();

        let (cb1, events1) = collector();
        let (cb2, events2) = collector();
        let id1 = storage.watch(cb1).await.unwrap();
        let id2 = storage.watch(cb2).await.unwrap();

        driver.fire(WatchEvent::Update, "k");

        assert_eq!(events1.lock().unwrap().len(), 1);
        assert_eq!(events2.lock().unwrap().len(), 1);

        storage.unwatch(id1).await;
        storage.unwatch(id2).await;
    }

    #[tokio::test]
    async fn unwatch_stops_driver_watchers() {
        let driver = Arc::new(WatchableDriver::default());
        let storage = Storage::new();
        storage
            .mount("m:", Arc::clone(&driver) as Arc<dyn Driver>)
            .await
            .unwrap();

        let (callback, events) = collector();
        let id = storage.watch(callback).await.unwrap();
        storage.unwatch(id).await;

        // The engine dropped its subscription list; even though this test
        // driver keeps its callback, no subscriber remains to notify.
        driver.fire(WatchEvent::Update, "k");
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mounting_while_watching_extends_the_session() {
        let storage = Storage::new();
        let (callback, events) = collector();
        let _id = storage.watch(callback).await.unwrap();

        let driver = Arc::new(WatchableDriver::default());
        storage
            .mount("late:", Arc::clone(&driver) as Arc<dyn Driver>)
            .await
            .unwrap();

        driver.fire(WatchEvent::Update, "k");
        assert_eq!(
            *events.lock().unwrap(),
            vec![(WatchEvent::Update, "late:k".to_string())]
        );
    }

    #[tokio::test]
    async fn facade_mutations_synthesize_events_for_watchless_drivers() {
        let storage = Storage::new();
        let (callback, events) = collector();
        let _id = storage.watch(callback).await.unwrap();

        storage.set("a", "1").await.unwrap();
        storage.remove("a").await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                (WatchEvent::Update, "a".to_string()),
                (WatchEvent::Remove, "a".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn watch_start_stop_is_idempotent() {
        let storage = Storage::new();
        let (callback, _events) = collector();
        let id = storage.watch(callback).await.unwrap();
        storage.unwatch(id).await;
        storage.unwatch(id).await;
        storage.unwatch_all().await;
    }

    // ── Metadata ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn meta_round_trips_through_reserved_key() {
        let storage = Storage::new();
        storage.set("k", "v").await.unwrap();
        storage
            .set_meta(
                "k",
                BTreeMap::from([
                    ("ttl".to_string(), Value::Int(120)),
                    ("sha".to_string(), Value::String("abc123".into())),
                ]),
            )
            .await
            .unwrap();

        let meta = storage.get_meta("k").await.unwrap();
        assert_eq!(meta.ttl, Some(120));
        assert_eq!(
            meta.extra.get("sha"),
            Some(&Value::String("abc123".into()))
        );

        let native_only = storage
            .get_meta_with("k", &Options::new().with_native_only(true))
            .await
            .unwrap();
        assert!(native_only.ttl.is_none());
    }

    #[tokio::test]
    async fn remove_with_remove_meta_drops_the_meta_entry() {
        let storage = Storage::new();
        storage.set("k", "v").await.unwrap();
        storage
            .set_meta("k", BTreeMap::from([("ttl".to_string(), Value::Int(1))]))
            .await
            .unwrap();

        storage
            .remove_with("k", &Options::new().with_remove_meta(true))
            .await
            .unwrap();

        assert!(!storage.has("k").await.unwrap());
        assert!(!storage.has("k$").await.unwrap());
    }

    // ── Snapshot / restore ────────────────────────────────────────────

    #[tokio::test]
    async fn snapshot_restores_into_a_fresh_engine() {
        let storage = Storage::new();
        storage.set("cfg:port", 8080i64).await.unwrap();
        storage.set("cfg:name", "svc").await.unwrap();
        storage.set_raw("cfg:blob", vec![0u8, 200, 3]).await.unwrap();

        let snapshot = storage.snapshot("cfg:").await.unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get("port").map(String::as_str), Some("8080"));

        let restored = Storage::new();
        restored
            .restore_snapshot("cfg:", snapshot)
            .await
            .unwrap();

        assert_eq!(
            restored.get("cfg:port").await.unwrap(),
            Some(Value::Int(8080))
        );
        assert_eq!(
            restored.get("cfg:name").await.unwrap(),
            Some(Value::String("svc".into()))
        );
        assert_eq!(
            restored.get_raw("cfg:blob").await.unwrap(),
            Some(vec![0u8, 200, 3])
        );
    }

    #[tokio::test]
    async fn snapshot_round_trips_bytes_that_spell_an_envelope() {
        let storage = Storage::new();
        // Bytes whose UTF-8 form is itself a valid envelope must come
        // back byte-exact, not decoded.
        let tricky = b"raw:3:YWJj".to_vec();
        storage.set_raw("k", tricky.clone()).await.unwrap();

        let snapshot = storage.snapshot("").await.unwrap();
        let restored = Storage::new();
        restored.restore_snapshot("", snapshot).await.unwrap();

        assert_eq!(restored.get_raw("k").await.unwrap(), Some(tricky));
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn dispose_resets_to_a_fresh_root() {
        let storage = Storage::new();
        storage.set("k", "v").await.unwrap();
        storage
            .mount("m:", Arc::new(MemoryDriver::new()))
            .await
            .unwrap();

        storage.dispose().await;

        assert!(storage.get("k").await.unwrap().is_none());
        assert_eq!(storage.mount_bases(), vec![String::new()]);
    }
}
