//! Supervised best-effort background work
//!
//! Side effects that must not delay or fail a detection (cache refresh
//! after a save, for instance) are spawned here. Failures and panics are
//! logged; `drain` waits for everything still running at shutdown.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio_util::task::TaskTracker;

#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` on the current runtime under `name`
    pub fn spawn<F, E>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.tracker.spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => log::debug!("Background task '{}' finished", name),
                Ok(Err(e)) => log::warn!("Background task '{}' failed: {}", name, e),
                Err(_) => log::error!("Background task '{}' panicked", name),
            }
        });
    }

    /// Number of tasks still running
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait for every spawned task to finish
    ///
    /// Tasks spawned after `drain` returns are still accepted.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_waits_for_outstanding_work() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = done.clone();
            tasks.spawn("counter", async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            });
        }

        tasks.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_contained() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("failing", async { Err::<(), _>("cache unavailable") });
        tasks.spawn("panicking", async {
            if true {
                panic!("refresh exploded");
            }
            Ok::<(), String>(())
        });

        tasks.drain().await;
        assert_eq!(tasks.len(), 0);

        // still usable after a drain
        let flag = Arc::new(AtomicUsize::new(0));
        let inner = flag.clone();
        tasks.spawn("after drain", async move {
            inner.store(1, Ordering::SeqCst);
            Ok::<(), String>(())
        });
        tasks.drain().await;
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }
}
