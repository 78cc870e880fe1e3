//! Detached background work.
//!
//! Play events are published from inside response bodies without holding up
//! the audio bytes. [`TaskSpawner`] is the seam handlers use for that work;
//! [`TokioSpawner`] also counts what is still in flight so shutdown can let
//! pending publishes finish before the broker link is closed.

use std::future::Future;
use std::time::Duration;

use tokio_util::task::TaskTracker;

/// Spawns fire-and-forget tasks.
///
/// The caller gets no handle and observes no completion signal.
pub trait TaskSpawner: Send + Sync {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tokio spawner bound to a runtime handle, tracking every task it starts.
///
/// Clones share the same tracker.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
    tracker: TaskTracker,
}

impl TokioSpawner {
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            tracker: TaskTracker::new(),
        }
    }

    /// Spawner on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    /// Tasks spawned and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits up to `timeout` for in-flight tasks to finish.
    ///
    /// Returns `false` if some were still running when the timeout hit. Tasks
    /// spawned while draining are waited for too.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        self.tracker.reopen();
        drained
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(self.tracker.track_future(future));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn spawned_tasks_run_and_are_counted() {
        let spawner = TokioSpawner::current();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = done.clone();
            spawner.spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(spawner.in_flight(), 3);

        assert!(spawner.drain(Duration::from_secs(1)).await);
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(spawner.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_timeout() {
        let spawner = TokioSpawner::current();
        spawner.spawn(std::future::pending());

        assert!(!spawner.drain(Duration::from_secs(2)).await);
        assert_eq!(spawner.in_flight(), 1);
    }

    #[tokio::test]
    async fn clones_share_the_tracker() {
        let spawner = TokioSpawner::current();
        let clone = spawner.clone();
        clone.spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        assert_eq!(spawner.in_flight(), 1);
        assert!(spawner.drain(Duration::from_secs(1)).await);
    }
}
