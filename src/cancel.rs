//! Cooperative cancellation, checked at sleep boundaries in `StampedeGuard`
//! and the `WriteBehind` worker loop.
//!
//! `tokio-util` (and its `CancellationToken`) is not part of this crate's
//! dependency stack, so this is hand-rolled in a dependency-minimal
//! style: `Arc<AtomicBool>` for the flag plus
//! `tokio::sync::Notify` so a waiting sleep wakes immediately instead of
//! polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Duration;

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, returning early if cancelled. Returns `true`
    /// if cancellation interrupted the sleep.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.inner.notify.notified() => true,
        }
    }
}
