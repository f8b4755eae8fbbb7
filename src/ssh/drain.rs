//! Counts in-flight SSH exec sessions so shutdown can wait for them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    active: Mutex<usize>,
    idle: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared counter of running sessions. Clones share the same count.
#[derive(Debug, Clone, Default)]
pub struct SessionCounter {
    inner: Arc<Inner>,
}

/// Held for the lifetime of one session; dropping it decrements the counter
/// on every exit path.
#[derive(Debug)]
#[must_use = "the session is only counted while the guard is alive"]
pub struct SessionGuard {
    inner: Arc<Inner>,
}

impl SessionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> SessionGuard {
        *self.inner.lock() += 1;
        SessionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active(&self) -> usize {
        *self.inner.lock()
    }

    /// Resolve once no session is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a wake-up between the check and the
            // await is not lost.
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait up to `timeout` for all sessions to finish. Returns `false` if
    /// some were still running when the timeout elapsed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_idle()).await.is_ok()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut active = self.inner.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}
