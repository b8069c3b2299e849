//! Layered [`Driver`] composition with tombstone deletes.
//!
//! An overlay stacks an ordered list of drivers: `layers[0]` is the top.
//! Reads fall through the stack top-down; writes land in the top layer
//! only; removes write a tombstone sentinel to the top layer so lower
//! layers stay untouched but the key reads as absent.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::warn;

use crate::driver::{Capabilities, Driver, Options};
use crate::error::{Result, StorageError};

/// Sentinel stored in the top layer to mask a key in lower layers.
///
/// Reserved at the protocol level: the overlay rejects attempts to store
/// this exact value.
pub const TOMBSTONE: &str = "__OVERLAY_REMOVED__";

/// Composite driver with read-through, top-write, tombstone-delete
/// semantics.
pub struct OverlayDriver {
    layers: Vec<Arc<dyn Driver>>,
}

impl OverlayDriver {
    /// Creates an overlay over `layers`, where `layers[0]` is the top.
    ///
    /// # Panics
    ///
    /// Panics if `layers` is empty; an overlay with no layers has no
    /// meaningful semantics.
    #[must_use]
    pub fn new(layers: Vec<Arc<dyn Driver>>) -> Self {
        assert!(!layers.is_empty(), "overlay requires at least one layer");
        Self { layers }
    }

    fn top(&self) -> &Arc<dyn Driver> {
        &self.layers[0]
    }
}

#[async_trait]
impl Driver for OverlayDriver {
    fn name(&self) -> &'static str {
        "overlay"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            set: true,
            remove: true,
            dispose: true,
            ..Capabilities::default()
        }
    }

    async fn has(&self, key: &str, opts: &Options) -> Result<bool> {
        for (index, layer) in self.layers.iter().enumerate() {
            if layer.has(key, opts).await? {
                // Only the top layer can hold a tombstone; lower layers
                // store plain data.
                if index == 0 {
                    if let Some(value) = layer.get(key, opts).await? {
                        if value == TOMBSTONE {
                            return Ok(false);
                        }
                    }
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn get(&self, key: &str, opts: &Options) -> Result<Option<String>> {
        for layer in &self.layers {
            if let Some(value) = layer.get(key, opts).await? {
                if value == TOMBSTONE {
                    return Ok(None);
                }
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, opts: &Options) -> Result<()> {
        if value == TOMBSTONE {
            return Err(StorageError::ReservedValue(TOMBSTONE.to_string()));
        }
        self.top().set(key, value, opts).await
    }

    async fn remove(&self, key: &str, opts: &Options) -> Result<()> {
        self.top().set(key, TOMBSTONE.to_string(), opts).await
    }

    async fn list_keys(&self, base: &str, opts: &Options) -> Result<Vec<String>> {
        let listings = join_all(
            self.layers
                .iter()
                .map(|layer| layer.list_keys(base, opts)),
        )
        .await;

        let mut candidates: Vec<String> = Vec::new();
        for listing in listings {
            candidates.extend(listing?);
        }
        candidates.sort();
        candidates.dedup();

        let mut keys = Vec::with_capacity(candidates.len());
        for key in candidates {
            let masked = matches!(
                self.top().get(&key, opts).await?.as_deref(),
                Some(TOMBSTONE)
            );
            if !masked {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn dispose(&self) -> Result<()> {
        for (index, layer) in self.layers.iter().enumerate() {
            if let Err(err) = layer.dispose().await {
                warn!(layer = index, %err, "overlay layer dispose failed");
            }
        }
        Ok(())
    }
}
