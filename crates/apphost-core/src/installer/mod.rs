//! The installer collaborator.
//!
//! An [`Installer`] validates lifecycle requests, performs the actual
//! install/update work while reporting progress through a [`ProgressSink`],
//! and answers the synchronous delete/list/icon queries. The coordinator only
//! drives it; it never touches tenant storage itself.

mod fetch;
mod fs;
mod lock;

pub use fetch::{DEFAULT_MAX_PACKAGE_SIZE, Fetcher, validate_source};
pub use fs::{FsInstaller, validate_slug};
pub use lock::{KeyLease, KeyLocks};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::DomainError;
use crate::model::{AppKey, AppType, LifecycleRequest, Manifest, Snapshot};

/// A request that passed validation and holds the lease on its key.
#[derive(Debug)]
pub struct Prepared {
    pub request: LifecycleRequest,
    /// First manifest reported for the task.
    pub manifest: Manifest,
    /// Record of the application before this operation, if any.
    pub previous: Option<Manifest>,
    pub lease: KeyLease,
}

/// An application icon read from tenant storage.
#[derive(Debug, Clone)]
pub struct Icon {
    pub content_type: &'static str,
    pub bytes: Bytes,
}

#[async_trait]
pub trait Installer: Send + Sync + 'static {
    /// Check the request against the current state of tenant storage and
    /// take the lease on its key. Must not start any work.
    async fn prepare(&self, request: &LifecycleRequest) -> Result<Prepared, DomainError>;

    /// Run a prepared operation to completion, reporting intermediate
    /// manifests on `progress`. Returns the final manifest.
    async fn run(
        &self,
        prepared: Prepared,
        progress: &mut ProgressSink,
    ) -> Result<Manifest, DomainError>;

    /// Remove a prepared application synchronously, returning its last
    /// manifest. The lease in `prepared` is held for the whole removal.
    async fn delete(&self, prepared: Prepared) -> Result<Manifest, DomainError>;

    /// List the applications of one type installed for a tenant.
    async fn list(&self, tenant: &str, app_type: AppType) -> Result<Vec<Manifest>, DomainError>;

    /// Read the icon declared by an installed application.
    async fn icon(&self, key: &AppKey) -> Result<Icon, DomainError>;
}

/// Producer side of a task's snapshot stream.
///
/// Numbers every snapshot so consumers see a strictly increasing `seq`.
/// Only the coordinator can publish the terminal snapshot.
#[derive(Debug)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<Snapshot>,
    seq: u64,
    last: Manifest,
}

impl ProgressSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Snapshot>, initial: Manifest) -> Self {
        Self {
            tx,
            seq: 0,
            last: initial,
        }
    }

    /// Publish an intermediate manifest.
    ///
    /// A consumer that went away is not an error: the work carries on and
    /// the snapshot is dropped.
    pub fn report(&mut self, manifest: Manifest) {
        self.last = manifest.clone();
        self.send(manifest, false, None);
    }

    /// The most recently reported manifest.
    pub fn last(&self) -> &Manifest {
        &self.last
    }

    pub(crate) fn finish(mut self, result: Result<Manifest, DomainError>) {
        match result {
            Ok(manifest) => self.send(manifest, true, None),
            Err(err) => {
                let manifest = self.last.errored(&err);
                self.send(manifest, true, Some(err));
            }
        }
    }

    fn send(&mut self, manifest: Manifest, terminal: bool, error: Option<DomainError>) {
        self.seq += 1;
        let snapshot = Snapshot {
            seq: self.seq,
            manifest,
            terminal,
            error,
        };
        if self.tx.send(snapshot).is_err() {
            trace!(seq = self.seq, "snapshot dropped, consumer gone");
        }
    }
}
