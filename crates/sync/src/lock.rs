//! Timer and lock primitives.
//!
//! `tokio::sync::Mutex` already grants its internal semaphore permit in
//! FIFO order, which is the fairness guarantee that matters here
//! (avoid shutdown starvation when a hydration holds the lock) — so
//! `AsyncLock` is a thin, documented wrapper rather than a hand-rolled
//! queue.

use std::time::Duration;

use tokio::sync::{
    Mutex,
    MutexGuard,
};

/// Single-owner FIFO lock serializing all stateful View Syncer
/// transitions.
pub struct AsyncLock<T> {
    inner: Mutex<T>,
}

impl<T> AsyncLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().await
    }
}

/// A cancellable, reschedulable timer used to drive periodic eviction
/// checks.
/// Dropping the handle cancels the in-flight wait.
pub struct EvictionTimer {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl EvictionTimer {
    pub fn idle() -> Self {
        Self { handle: None }
    }

    /// Arm the timer to fire `notify` once after `delay`, replacing any
    /// previously scheduled fire.
    pub fn schedule(&mut self, delay: Duration, notify: std::sync::Arc<tokio::sync::Notify>) {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            notify.notify_one();
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for EvictionTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
