//! A scripted [`Installer`] for exercising the coordinator and the HTTP
//! delivery layer without touching storage or the network.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

use crate::error::DomainError;
use crate::installer::{Icon, Installer, KeyLocks, Prepared, ProgressSink};
use crate::model::{AppKey, AppState, AppType, LifecycleRequest, Manifest, Operation};

/// Installer that replays a fixed list of states.
///
/// With a gate, the worker takes one permit before every report and one
/// before returning, so a test can advance it one snapshot at a time.
#[derive(Debug)]
pub struct ScriptedInstaller {
    locks: KeyLocks,
    steps: Vec<AppState>,
    outcome: Result<(), DomainError>,
    prepare_error: Option<DomainError>,
    gate: Option<Arc<Semaphore>>,
    installed: Mutex<HashSet<AppKey>>,
    runs: AtomicUsize,
}

impl Default for ScriptedInstaller {
    fn default() -> Self {
        Self {
            locks: KeyLocks::new(),
            steps: vec![AppState::Downloading],
            outcome: Ok(()),
            prepare_error: None,
            gate: None,
            installed: Mutex::new(HashSet::new()),
            runs: AtomicUsize::new(0),
        }
    }
}

impl ScriptedInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intermediate states reported by `run`, in order.
    pub fn with_steps(mut self, steps: Vec<AppState>) -> Self {
        self.steps = steps;
        self
    }

    /// Make `run` fail with `err` after its steps.
    pub fn failing(mut self, err: DomainError) -> Self {
        self.outcome = Err(err);
        self
    }

    /// Make `prepare` fail with `err`.
    pub fn rejecting(mut self, err: DomainError) -> Self {
        self.prepare_error = Some(err);
        self
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Pretend `key` is already installed, for update and delete requests.
    pub fn with_installed(self, key: AppKey) -> Self {
        self.installed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
        self
    }

    /// How many times `run` has been entered.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    async fn pass_gate(&self) {
        if let Some(gate) = &self.gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
    }

    fn is_installed(&self, key: &AppKey) -> bool {
        self.installed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

#[async_trait]
impl Installer for ScriptedInstaller {
    async fn prepare(&self, request: &LifecycleRequest) -> Result<Prepared, DomainError> {
        if let Some(err) = &self.prepare_error {
            return Err(err.clone());
        }
        let key = &request.key;
        let lease = self.locks.try_acquire(key)?;
        let installed = self.is_installed(key);
        let manifest = match request.operation {
            Operation::Install if installed => {
                return Err(DomainError::AlreadyExists(key.slug.clone()));
            }
            Operation::Install => {
                let source = request.source.as_deref().ok_or(DomainError::MissingSource)?;
                Manifest::pending(key, source, AppState::Installing)
            }
            Operation::Update | Operation::Delete if !installed => {
                return Err(DomainError::NotFound(key.slug.clone()));
            }
            Operation::Update => Manifest::pending(key, "scripted://", AppState::Upgrading),
            Operation::Delete => Manifest::pending(key, "scripted://", AppState::Ready),
        };
        Ok(Prepared {
            request: request.clone(),
            previous: None,
            manifest,
            lease,
        })
    }

    async fn run(
        &self,
        prepared: Prepared,
        progress: &mut ProgressSink,
    ) -> Result<Manifest, DomainError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let _lease = prepared.lease;
        for state in &self.steps {
            self.pass_gate().await;
            progress.report(progress.last().with_state(*state));
        }
        self.pass_gate().await;
        self.outcome
            .clone()
            .map(|()| progress.last().with_state(AppState::Ready))
    }

    async fn delete(&self, prepared: Prepared) -> Result<Manifest, DomainError> {
        self.installed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&prepared.request.key);
        Ok(prepared.manifest)
    }

    async fn list(&self, _tenant: &str, _app_type: AppType) -> Result<Vec<Manifest>, DomainError> {
        Ok(Vec::new())
    }

    async fn icon(&self, key: &AppKey) -> Result<Icon, DomainError> {
        if !self.is_installed(key) {
            return Err(DomainError::NotFound(key.slug.clone()));
        }
        Ok(Icon {
            content_type: "image/svg+xml",
            bytes: Bytes::from_static(b"<svg/>"),
        })
    }
}
