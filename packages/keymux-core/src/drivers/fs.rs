//! Filesystem-backed [`Driver`]: keys map to paths under a base directory.
//!
//! Key segments become path segments (`:` → `/`). Keys carrying a `..`
//! segment are rejected before any path is built, and every resolved path
//! is additionally checked to remain under the base directory. Writes are
//! atomic (temp sibling + rename). Change notification uses a recursive
//! [`notify`] watcher that reports mount-relative colon keys.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{RecursiveMode, Watcher};
use rand::Rng;
use tracing::{debug, warn};

use crate::driver::{
    Capabilities, Driver, Metadata, Options, WatchCallback, WatchEvent, WatchGuard,
};
use crate::error::{Result, StorageError};
use crate::key::{filter_key_by_depth, has_traversal, normalize_key};

/// Patterns ignored by enumeration and watching unless overridden.
pub const DEFAULT_IGNORES: &[&str] = &["**/node_modules/**", "**/.git/**"];

/// Configuration for [`FsDriver`].
#[derive(Debug, Clone, Default)]
pub struct FsDriverConfig {
    /// Root directory all keys resolve under. Required.
    pub base: Option<PathBuf>,
    /// Make every mutator a silent no-op.
    pub read_only: bool,
    /// Disable `clear` even when not read-only.
    pub no_clear: bool,
    /// Ignore globs for enumeration and watching. `None` uses
    /// [`DEFAULT_IGNORES`]; `Some(vec![])` disables ignoring.
    pub ignore: Option<Vec<String>>,
}

impl FsDriverConfig {
    /// Starts a config rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: Some(base.into()),
            ..Self::default()
        }
    }

    /// Makes every mutator a silent no-op.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Disables `clear`.
    #[must_use]
    pub fn no_clear(mut self) -> Self {
        self.no_clear = true;
        self
    }

    /// Replaces the ignore globs.
    #[must_use]
    pub fn ignore(mut self, patterns: Vec<String>) -> Self {
        self.ignore = Some(patterns);
        self
    }
}

/// Filesystem driver rooted at a base directory.
#[derive(Debug)]
pub struct FsDriver {
    base: PathBuf,
    read_only: bool,
    no_clear: bool,
    ignore: Arc<GlobSet>,
}

impl FsDriver {
    /// Creates a driver from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MissingConfig`] when no base directory is
    /// configured. A malformed ignore configuration does not fail: it is
    /// treated as no ignore rules.
    pub fn new(config: FsDriverConfig) -> Result<Self> {
        let base = config.base.ok_or(StorageError::MissingConfig("base"))?;
        let patterns: Vec<String> = match config.ignore {
            Some(patterns) => patterns,
            None => DEFAULT_IGNORES.iter().map(|p| (*p).to_string()).collect(),
        };
        Ok(Self {
            base,
            read_only: config.read_only,
            no_clear: config.no_clear,
            ignore: Arc::new(build_ignore_set(&patterns)),
        })
    }

    /// Convenience constructor for the common case.
    pub fn with_base(base: impl Into<PathBuf>) -> Result<Self> {
        Self::new(FsDriverConfig::new(base))
    }

    /// The configured base directory.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolves a key to its path, rejecting traversal sequences.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let key = normalize_key(key);
        if has_traversal(&key) {
            return Err(StorageError::InvalidKey(key));
        }
        let path = self.base.join(key.replace(':', "/"));
        // The traversal check above already excludes `..` segments; this
        // guards the invariant directly in case the two ever drift.
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
            || !path.starts_with(&self.base)
        {
            return Err(StorageError::InvalidKey(key));
        }
        Ok(path)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base).ok()?;
        let segments: Vec<&str> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect();
        if segments.is_empty() {
            None
        } else {
            Some(segments.join(":"))
        }
    }

    fn ignored(&self, path: &Path) -> bool {
        match path.strip_prefix(&self.base) {
            Ok(relative) => self.ignore.is_match(relative),
            Err(_) => false,
        }
    }
}

/// Compiles ignore globs; a malformed configuration yields no ignore rules.
fn build_ignore_set(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(err) => {
                warn!(pattern, %err, "malformed ignore pattern; ignoring no paths");
                return GlobSet::empty();
            }
        }
    }
    builder.build().unwrap_or_else(|err| {
        warn!(%err, "ignore globs failed to compile; ignoring no paths");
        GlobSet::empty()
    })
}

/// Writes `contents` atomically: temp sibling in the same directory, then
/// rename over the destination.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("entry");
    let suffix: u32 = rand::rng().random();
    let tmp = path.with_file_name(format!(".{file_name}.{suffix:08x}.tmp"));

    tokio::fs::write(&tmp, contents).await?;
    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(err.into())
        }
    }
}

/// Reads a file, mapping not-found to `None`.
async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl Driver for FsDriver {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            set: !self.read_only,
            set_raw: !self.read_only,
            get_raw: true,
            remove: !self.read_only,
            get_meta: true,
            clear: !self.read_only && !self.no_clear,
            watch: true,
            supports_max_depth: true,
            ..Capabilities::default()
        }
    }

    async fn has(&self, key: &str, _opts: &Options) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn get(&self, key: &str, opts: &Options) -> Result<Option<String>> {
        let Some(bytes) = self.get_raw(key, opts).await? else {
            return Ok(None);
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|err| StorageError::Serialization(err.to_string()))
    }

    async fn get_raw(&self, key: &str, _opts: &Options) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        read_optional(&path).await
    }

    async fn set(&self, key: &str, value: String, opts: &Options) -> Result<()> {
        self.set_raw(key, value.into_bytes(), opts).await
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, _opts: &Options) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let path = self.path_for(key)?;
        write_atomic(&path, &value).await
    }

    async fn remove(&self, key: &str, _opts: &Options) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_meta(&self, key: &str, _opts: &Options) -> Result<Option<Metadata>> {
        let path = self.path_for(key)?;
        let stat = match tokio::fs::metadata(&path).await {
            Ok(stat) => stat,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Some(Metadata::default()));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Some(Metadata {
            atime: stat.accessed().ok(),
            mtime: stat.modified().ok(),
            ctime: stat.modified().ok(),
            birthtime: stat.created().ok(),
            size: Some(stat.len()),
            ..Metadata::default()
        }))
    }

    async fn list_keys(&self, base: &str, opts: &Options) -> Result<Vec<String>> {
        let start = self.path_for(base)?;
        if !tokio::fs::try_exists(&start).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let max_depth = opts.max_depth();
        let mut keys = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if self.ignored(&path) {
                    continue;
                }
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    // Depth-limited listings never need entries below the
                    // cutoff, so whole subtrees can be skipped.
                    let dir_depth = self
                        .key_for(&path)
                        .map_or(0, |key| key.matches(':').count());
                    if max_depth.map_or(true, |limit| dir_depth < limit) {
                        pending.push(path);
                    }
                } else if let Some(key) = self.key_for(&path) {
                    if filter_key_by_depth(&key, max_depth) {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(keys)
    }

    async fn clear(&self, base: &str, _opts: &Options) -> Result<()> {
        if self.read_only || self.no_clear {
            return Ok(());
        }
        let root = self.path_for(base)?;
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        // Contents only; the base directory itself stays.
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            if let Err(err) = result {
                if err.kind() != std::io::ErrorKind::NotFound {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    async fn watch(&self, callback: WatchCallback) -> Result<WatchGuard> {
        if !tokio::fs::try_exists(&self.base).await.unwrap_or(false) {
            warn!(base = %self.base.display(), "watch base does not exist; not watching");
            return Ok(WatchGuard::noop());
        }

        let base = self.base.clone();
        let ignore = Arc::clone(&self.ignore);
        let handler = move |result: std::result::Result<notify::Event, notify::Error>| {
            let event = match result {
                Ok(event) => event,
                Err(err) => {
                    warn!(%err, "filesystem watch error");
                    return;
                }
            };
            let Some(kind) = classify_event(&event.kind) else {
                return;
            };
            for path in &event.paths {
                if let Ok(relative) = path.strip_prefix(&base) {
                    if ignore.is_match(relative) {
                        continue;
                    }
                }
                if is_temp_sibling(path) {
                    continue;
                }
                if kind == WatchEvent::Update && !path.is_file() {
                    continue;
                }
                if let Some(key) = key_for_path(&base, path) {
                    callback(kind, &key);
                }
            }
        };

        let mut watcher = notify::recommended_watcher(handler)
            .map_err(|err| StorageError::Backend(anyhow::anyhow!(err)))?;
        watcher
            .watch(&self.base, RecursiveMode::Recursive)
            .map_err(|err| StorageError::Backend(anyhow::anyhow!(err)))?;
        debug!(base = %self.base.display(), "filesystem watch started");

        Ok(WatchGuard::new(move || drop(watcher)))
    }
}

/// Whether the path is one of this driver's in-flight atomic-write
/// siblings; those never surface as watch events.
fn is_temp_sibling(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |name| name.starts_with('.') && name.ends_with(".tmp"))
}

/// Maps a notify event kind onto the watch surface, or `None` to drop it.
fn classify_event(kind: &notify::EventKind) -> Option<WatchEvent> {
    use notify::EventKind;
    match kind {
        EventKind::Create(_) | EventKind::Modify(_) => Some(WatchEvent::Update),
        EventKind::Remove(_) => Some(WatchEvent::Remove),
        _ => None,
    }
}

/// Converts a watched path into a mount-relative colon key.
///
/// Platform separators (both `/` and `\`) are normalized to `:`.
fn key_for_path(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let key = normalize_key(&relative.to_string_lossy());
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}
