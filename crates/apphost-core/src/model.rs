use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::DomainError;

/// Kind of installable application.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AppType {
    Webapp,
    Konnector,
}

impl AppType {
    /// File name of the manifest shipped inside a package of this type.
    pub fn manifest_file(&self) -> &'static str {
        match self {
            AppType::Webapp => "manifest.webapp",
            AppType::Konnector => "manifest.konnector",
        }
    }
}

/// Lifecycle operation requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Install,
    Update,
    Delete,
}

/// Scoping key of a lifecycle task: one application of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppKey {
    pub tenant: String,
    pub slug: String,
    pub app_type: AppType,
}

impl AppKey {
    pub fn new(tenant: impl Into<String>, slug: impl Into<String>, app_type: AppType) -> Self {
        Self {
            tenant: tenant.into(),
            slug: slug.into(),
            app_type,
        }
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.app_type, self.slug)
    }
}

/// Everything needed to create a lifecycle task.
#[derive(Debug, Clone)]
pub struct LifecycleRequest {
    pub key: AppKey,
    pub operation: Operation,
    /// Package location; required for install, rejected otherwise.
    pub source: Option<String>,
}

impl LifecycleRequest {
    pub fn install(key: AppKey, source: Option<String>) -> Self {
        Self {
            key,
            operation: Operation::Install,
            source,
        }
    }

    pub fn update(key: AppKey) -> Self {
        Self {
            key,
            operation: Operation::Update,
            source: None,
        }
    }

    pub fn delete(key: AppKey) -> Self {
        Self {
            key,
            operation: Operation::Delete,
            source: None,
        }
    }
}

/// State recorded in an application's manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AppState {
    Installing,
    Upgrading,
    Downloading,
    Ready,
    Errored,
}

/// Metadata of an installed (or installing) application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub slug: String,
    #[serde(rename = "type")]
    pub app_type: AppType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub source: String,
    pub state: AppState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Manifest {
    /// A placeholder manifest for an application whose package has not been
    /// read yet.
    pub fn pending(key: &AppKey, source: impl Into<String>, state: AppState) -> Self {
        let now = Utc::now();
        Self {
            slug: key.slug.clone(),
            app_type: key.app_type,
            name: key.slug.clone(),
            version: None,
            source: source.into(),
            state,
            icon: None,
            description: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Return a copy moved to `state`, refreshing `updated_at`.
    pub fn with_state(&self, state: AppState) -> Self {
        let mut next = self.clone();
        next.state = state;
        next.updated_at = Utc::now();
        next
    }

    /// Return a copy marked as errored with the given error message.
    pub fn errored(&self, err: &DomainError) -> Self {
        let mut next = self.with_state(AppState::Errored);
        next.error = Some(err.to_string());
        next
    }
}

/// Status of a lifecycle task as seen by its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Running,
    Done,
    Failed,
}

/// A point-in-time view of a task's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Position in the task's snapshot sequence; strictly increasing.
    pub seq: u64,
    pub manifest: Manifest,
    pub terminal: bool,
    /// Set only on a terminal snapshot of a failed task.
    pub error: Option<DomainError>,
}

impl Snapshot {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}
