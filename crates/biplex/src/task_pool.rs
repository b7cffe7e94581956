//! Bounded task pool backing handler dispatch.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

/// Spawns handler tasks, optionally bounding how many run at once.
///
/// Each session's tasks are tracked by its own [`TaskTracker`] so graceful
/// shutdown can wait for running handlers; the permit pool is shared across
/// the whole peer.
#[derive(Clone)]
pub struct TaskPool {
    sem: Option<Arc<Semaphore>>,
}

impl TaskPool {
    /// A pool with no concurrency bound.
    pub fn unbounded() -> Self {
        Self { sem: None }
    }

    /// A pool running at most `max_tasks` handlers at once; excess tasks
    /// queue on the semaphore.
    pub fn bounded(max_tasks: usize) -> Self {
        Self {
            sem: Some(Arc::new(Semaphore::new(max_tasks.max(1)))),
        }
    }

    /// Spawns `fut` under `tracker`, waiting for a pool slot first when
    /// the pool is bounded.
    pub(crate) fn spawn<F>(&self, tracker: &TaskTracker, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.sem {
            None => {
                tracker.spawn(fut);
            }
            Some(sem) => {
                let sem = sem.clone();
                tracker.spawn(async move {
                    // A closed semaphore only happens at shutdown; the task
                    // is dropped with it.
                    let Ok(_permit) = sem.acquire_owned().await else {
                        return;
                    };
                    fut.await;
                });
            }
        }
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_bounded_pool_limits_concurrency() {
        let pool = TaskPool::bounded(2);
        let tracker = TaskTracker::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            pool.spawn(&tracker, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        tracker.close();
        tracker.wait().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_unbounded_pool_runs_everything() {
        let pool = TaskPool::unbounded();
        let tracker = TaskTracker::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let done = done.clone();
            pool.spawn(&tracker, async move {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        tracker.close();
        tracker.wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 16);
    }
}
