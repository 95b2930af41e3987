//! Lifecycle coordination.
//!
//! The [`Coordinator`] turns a validated [`LifecycleRequest`] into a
//! [`LifecycleTask`]: a handle whose background work runs on the shared
//! [`TaskRegistry`] and whose progress is read back, one snapshot at a
//! time, with [`LifecycleTask::next`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::DomainError;
use crate::installer::{Icon, Installer, Prepared, ProgressSink};
use crate::model::{AppKey, AppType, LifecycleRequest, Manifest, Operation, Snapshot, TaskStatus};
use crate::registry::{BackgroundTask, TaskRegistry};

#[derive(Clone)]
pub struct Coordinator {
    installer: Arc<dyn Installer>,
    registry: TaskRegistry,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(installer: Arc<dyn Installer>, registry: TaskRegistry) -> Self {
        Self {
            installer,
            registry,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Validate `request` and build a task for it without starting any work.
    ///
    /// Validation failures (bad slug, missing source, unknown application,
    /// busy key, ...) are returned here, synchronously. On success the task
    /// already holds the lease on its key and one snapshot is queued.
    #[instrument(skip(self, request), fields(key = %request.key, op = %request.operation))]
    pub async fn create(&self, request: LifecycleRequest) -> Result<LifecycleTask, DomainError> {
        let prepared = self.installer.prepare(&request).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut sink = ProgressSink::new(tx, prepared.manifest.clone());
        sink.report(prepared.manifest.clone());

        let task = LifecycleTask {
            id: Uuid::new_v4(),
            key: request.key,
            operation: request.operation,
            status: TaskStatus::Created,
            rx,
            last: prepared.manifest.clone(),
            last_seq: 0,
            terminal: None,
            pending: Some(PendingWork { prepared, sink }),
        };
        debug!(task = %task.id, "lifecycle task created");
        Ok(task)
    }

    /// Begin the task's background work.
    ///
    /// Returns at once. Calling it again on a started task does nothing and
    /// returns `None`.
    pub fn start(&self, task: &mut LifecycleTask) -> Option<BackgroundTask> {
        let Some(PendingWork { prepared, mut sink }) = task.pending.take() else {
            warn!(task = %task.id, key = %task.key, "task already started");
            return None;
        };
        task.status = TaskStatus::Running;

        let installer = Arc::clone(&self.installer);
        let task_id = task.id;
        let key = task.key.clone();
        let worker = self.registry.spawn("lifecycle", key.to_string(), async move {
            let result = installer.run(prepared, &mut sink).await;
            match &result {
                Ok(m) => info!(task = %task_id, %key, state = %m.state, "lifecycle task finished"),
                Err(e) => warn!(task = %task_id, %key, error = %e, "lifecycle task failed"),
            }
            sink.finish(result);
        });
        Some(worker)
    }

    /// Complete a delete task synchronously and return the removed
    /// application's last manifest.
    #[instrument(skip(self, task), fields(key = %task.key))]
    pub async fn delete(&self, mut task: LifecycleTask) -> Result<Manifest, DomainError> {
        let Some(PendingWork { prepared, .. }) = task.pending.take() else {
            return Err(DomainError::Interrupted(format!(
                "task {} was already started",
                task.id
            )));
        };
        self.installer.delete(prepared).await
    }

    pub async fn list(&self, tenant: &str, app_type: AppType) -> Result<Vec<Manifest>, DomainError> {
        self.installer.list(tenant, app_type).await
    }

    pub async fn icon(&self, key: &AppKey) -> Result<Icon, DomainError> {
        self.installer.icon(key).await
    }
}

struct PendingWork {
    prepared: Prepared,
    sink: ProgressSink,
}

/// Handle on one lifecycle operation.
///
/// `next` takes `&mut self`, so a task has exactly one consumer at a time.
/// Dropping a task that was never started releases its lease without doing
/// any work; dropping a started one leaves the work running to completion.
pub struct LifecycleTask {
    id: Uuid,
    key: AppKey,
    operation: Operation,
    status: TaskStatus,
    rx: mpsc::UnboundedReceiver<Snapshot>,
    last: Manifest,
    last_seq: u64,
    terminal: Option<Snapshot>,
    pending: Option<PendingWork>,
}

impl std::fmt::Debug for LifecycleTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleTask")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("operation", &self.operation)
            .field("status", &self.status)
            .field("last_seq", &self.last_seq)
            .finish_non_exhaustive()
    }
}

impl LifecycleTask {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &AppKey {
        &self.key
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Wait for the next snapshot.
    ///
    /// Snapshots already queued are coalesced: the most recent one is
    /// returned, so a consumer that falls behind catches up in one call.
    /// Once a terminal snapshot has been returned, every later call returns
    /// it again without waiting. If the background work goes away without
    /// a terminal snapshot, a failed one carrying
    /// [`DomainError::Interrupted`] is produced instead.
    ///
    /// On a task that was never started this returns the initial snapshot
    /// and then waits until [`Coordinator::start`] is called.
    pub async fn next(&mut self) -> Snapshot {
        if let Some(done) = &self.terminal {
            return done.clone();
        }

        let mut latest = match self.rx.recv().await {
            Some(snapshot) => snapshot,
            None => self.interrupted(),
        };
        while !latest.terminal {
            match self.rx.try_recv() {
                Ok(snapshot) => latest = snapshot,
                Err(_) => break,
            }
        }

        self.last_seq = latest.seq;
        self.last = latest.manifest.clone();
        if latest.terminal {
            self.status = if latest.is_failed() {
                TaskStatus::Failed
            } else {
                TaskStatus::Done
            };
            self.terminal = Some(latest.clone());
        }
        latest
    }

    fn interrupted(&self) -> Snapshot {
        let err = DomainError::Interrupted(format!(
            "{} of {} ended without a final state",
            self.operation, self.key
        ));
        warn!(task = %self.id, key = %self.key, "snapshot stream closed early");
        Snapshot {
            seq: self.last_seq + 1,
            manifest: self.last.errored(&err),
            terminal: true,
            error: Some(err),
        }
    }
}
