//! Core of the application host: the lifecycle coordinator, the installer
//! that backs it and the registry of background work.

pub mod coordinator;
pub mod error;
pub mod installer;
pub mod model;
pub mod registry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use coordinator::{Coordinator, LifecycleTask};
pub use error::DomainError;
pub use installer::{DEFAULT_MAX_PACKAGE_SIZE, Fetcher, FsInstaller, Icon, Installer};
pub use model::{AppKey, AppState, AppType, LifecycleRequest, Manifest, Operation, Snapshot, TaskStatus};
pub use registry::{BackgroundTask, TaskRegistry};
