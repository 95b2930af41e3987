//! Tracked background work.
//!
//! Every detached future the service starts (installer workers, drain
//! loops) is spawned through a [`TaskRegistry`], so shutdown can wait for
//! them instead of silently cutting them off.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a tracked task is doing, for shutdown diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLabel {
    pub kind: &'static str,
    pub target: String,
}

type LiveMap = Arc<Mutex<HashMap<Uuid, TaskLabel>>>;

#[derive(Clone, Default)]
pub struct TaskRegistry {
    tracker: TaskTracker,
    live: LiveMap,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskRegistry({} live)", self.tracker.len())
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` as a tracked background task.
    pub fn spawn<F>(&self, kind: &'static str, target: impl Into<String>, fut: F) -> BackgroundTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let label = TaskLabel {
            kind,
            target: target.into(),
        };
        if self.tracker.is_closed() {
            warn!(%id, kind, target = %label.target, "spawning after shutdown started");
        }
        lock(&self.live).insert(id, label);

        let guard = LiveGuard {
            id,
            live: Arc::clone(&self.live),
        };
        let handle = self.tracker.spawn(async move {
            let _guard = guard;
            fut.await;
        });
        debug!(%id, kind, "background task spawned");
        BackgroundTask { id, handle }
    }

    /// Number of tracked tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Labels of the tasks still running.
    pub fn live(&self) -> Vec<TaskLabel> {
        lock(&self.live).values().cloned().collect()
    }

    /// Stop accepting work and wait up to `grace` for every tracked task.
    ///
    /// Returns `true` when everything finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            info!(pending, grace_secs = grace.as_secs(), "waiting for background tasks");
        }
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                info!("all background tasks finished");
                true
            }
            Err(_) => {
                for label in self.live() {
                    warn!(kind = label.kind, target = %label.target, "background task still running at shutdown");
                }
                false
            }
        }
    }
}

/// Handle to one tracked task; dropping it detaches the task (the registry
/// still tracks it).
#[derive(Debug)]
pub struct BackgroundTask {
    id: Uuid,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the task to finish. Returns `false` if it panicked.
    pub async fn join(self) -> bool {
        match self.handle.await {
            Ok(()) => true,
            Err(e) => {
                warn!(id = %self.id, error = %e, "background task did not complete");
                false
            }
        }
    }
}

struct LiveGuard {
    id: Uuid,
    live: LiveMap,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        lock(&self.live).remove(&self.id);
    }
}

fn lock(live: &LiveMap) -> MutexGuard<'_, HashMap<Uuid, TaskLabel>> {
    live.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn tracks_until_finished() {
        let registry = TaskRegistry::new();
        let (tx, rx) = oneshot::channel::<()>();
        let task = registry.spawn("test", "t/webapp/foo", async move {
            let _ = rx.await;
        });

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.live()[0].target, "t/webapp/foo");

        tx.send(()).unwrap();
        assert!(task.join().await);
        assert!(registry.is_empty());
        assert!(registry.live().is_empty());
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_tasks() {
        let registry = TaskRegistry::new();
        registry.spawn("test", "slow", async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        assert!(registry.shutdown(Duration::from_secs(5)).await);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_reports_stragglers() {
        let registry = TaskRegistry::new();
        let (_tx, rx) = oneshot::channel::<()>();
        registry.spawn("test", "stuck", async move {
            let _ = rx.await;
        });
        assert!(!registry.shutdown(Duration::from_millis(20)).await);
        assert_eq!(registry.live().len(), 1);
    }

    #[tokio::test]
    async fn panicking_task_is_untracked() {
        let registry = TaskRegistry::new();
        let task = registry.spawn("test", "boom", async { panic!("boom") });
        assert!(!task.join().await);
        assert!(registry.live().is_empty());
    }
}
