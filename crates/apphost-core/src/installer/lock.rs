use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::error::DomainError;
use crate::model::AppKey;

/// Exclusive, in-process leases keyed by [`AppKey`].
///
/// Only one lifecycle task may mutate a given application at a time. The
/// lease is taken when a task is prepared and released when the returned
/// [`KeyLease`] is dropped, which happens when the background work ends.
#[derive(Clone, Default)]
pub struct KeyLocks {
    held: Arc<Mutex<HashSet<AppKey>>>,
}

impl std::fmt::Debug for KeyLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyLocks({} held)", self.lock().len())
    }
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `key`, or fail with [`DomainError::Busy`].
    pub fn try_acquire(&self, key: &AppKey) -> Result<KeyLease, DomainError> {
        let mut held = self.lock();
        if !held.insert(key.clone()) {
            return Err(DomainError::Busy(key.slug.clone()));
        }
        trace!(%key, "lease acquired");
        Ok(KeyLease {
            key: key.clone(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, key: &AppKey) -> bool {
        self.lock().contains(key)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<AppKey>> {
        // The set holds plain keys; a panic elsewhere cannot leave it torn.
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Proof of exclusive access to one application key.
#[derive(Debug)]
pub struct KeyLease {
    key: AppKey,
    held: Arc<Mutex<HashSet<AppKey>>>,
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.key);
        trace!(key = %self.key, "lease released");
    }
}
