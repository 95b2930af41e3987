//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use apphost_core::Coordinator;

use crate::config::Config;
use crate::middleware::Authorizer;

#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Creates and runs lifecycle tasks; owns the background task registry.
    pub coordinator: Coordinator,
    pub authorizer: Arc<dyn Authorizer>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}
