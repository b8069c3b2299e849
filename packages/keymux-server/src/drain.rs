//! In-flight request tracking for graceful drain.
//!
//! The server owns one [`RequestTracker`]; the protocol handler takes a
//! [`RequestGuard`] per request. Shutdown waits on [`RequestTracker::drain`],
//! which resolves as soon as the last guard drops — the count is published
//! through a `tokio::sync::watch` channel, so draining is woken by the
//! final decrement instead of polling.

use std::time::Duration;

use tokio::sync::watch;

/// Counts requests currently inside the protocol handler.
#[derive(Debug)]
pub struct RequestTracker {
    active: watch::Sender<u64>,
}

impl RequestTracker {
    /// Creates a tracker with nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self { active }
    }

    /// Registers one in-flight request.
    ///
    /// The count drops when the returned guard does, even if the request
    /// handler panics.
    #[must_use]
    pub fn track(&self) -> RequestGuard {
        self.active.send_modify(|count| *count += 1);
        RequestGuard {
            active: self.active.clone(),
        }
    }

    /// Number of requests currently in flight.
    #[must_use]
    pub fn active(&self) -> u64 {
        *self.active.borrow()
    }

    /// Waits until every in-flight request has finished, up to `timeout`.
    ///
    /// Returns `true` once the count reaches zero, `false` if the timeout
    /// expires first (requests were still running).
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut count = self.active.subscribe();
        tokio::time::timeout(timeout, async move {
            while *count.borrow_and_update() != 0 {
                if count.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for one in-flight request; decrements the tracker on drop.
#[derive(Debug)]
pub struct RequestGuard {
    active: watch::Sender<u64>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.active.send_modify(|count| *count = count.saturating_sub(1));
    }
}
