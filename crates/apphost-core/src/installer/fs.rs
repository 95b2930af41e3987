use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::fetch::{Fetcher, unpack_tar_gz, validate_source};
use super::{Icon, Installer, KeyLocks, Prepared, ProgressSink};
use crate::error::DomainError;
use crate::model::{AppKey, AppState, AppType, LifecycleRequest, Manifest, Operation};

const REGISTRY_DIR: &str = ".registry";
const MAX_SLUG_LEN: usize = 64;

/// Check the slug naming rule: 1 to 64 characters of `[a-z0-9-]`, not
/// starting with a dash.
pub fn validate_slug(slug: &str) -> Result<(), DomainError> {
    let valid = !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && !slug.starts_with('-')
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(DomainError::InvalidSlug(slug.to_owned()))
    }
}

/// Fields read from the manifest file shipped inside a package.
#[derive(Debug, Deserialize)]
struct PackageManifest {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Installer backed by a directory tree.
///
/// Layout under `root`:
///
/// ```text
/// <tenant>/<type>/<slug>/...              unpacked application files
/// <tenant>/<type>/.registry/<slug>.json   application record (Manifest)
/// ```
#[derive(Debug, Clone)]
pub struct FsInstaller {
    root: PathBuf,
    fetcher: Fetcher,
    locks: KeyLocks,
}

impl FsInstaller {
    pub fn new(root: impl Into<PathBuf>, fetcher: Fetcher) -> Self {
        Self {
            root: root.into(),
            fetcher,
            locks: KeyLocks::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    fn type_dir(&self, tenant: &str, app_type: AppType) -> PathBuf {
        self.root.join(tenant).join(app_type.as_ref())
    }

    fn app_dir(&self, key: &AppKey) -> PathBuf {
        self.type_dir(&key.tenant, key.app_type).join(&key.slug)
    }

    fn record_path(&self, key: &AppKey) -> PathBuf {
        self.type_dir(&key.tenant, key.app_type)
            .join(REGISTRY_DIR)
            .join(format!("{}.json", key.slug))
    }

    async fn read_record(&self, key: &AppKey) -> Result<Option<Manifest>, DomainError> {
        match tokio::fs::read(self.record_path(key)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, key: &AppKey, manifest: &Manifest) -> Result<(), DomainError> {
        let path = self.record_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a listing never sees a half-written record.
        let tmp = path.with_extension(format!("json.{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(manifest)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Fetch, unpack and read the package behind `source` into a staging
    /// directory, then swap it into place.
    async fn fetch_and_place(
        &self,
        key: &AppKey,
        source: &str,
        progress: &mut ProgressSink,
    ) -> Result<Manifest, DomainError> {
        let url = validate_source(source)?;
        progress.report(progress.last().with_state(AppState::Downloading));

        let bytes = self.fetcher.fetch(&url).await?;
        debug!(%key, size = bytes.len(), "package downloaded");

        let type_dir = self.type_dir(&key.tenant, key.app_type);
        let staging = type_dir.join(format!(".staging-{}-{}", key.slug, Uuid::new_v4()));
        let result = self.unpack_and_read(key, bytes, &staging).await;
        let package = match result {
            Ok(p) => p,
            Err(e) => {
                remove_dir_quietly(&staging).await;
                return Err(e);
            }
        };

        let app_dir = self.app_dir(key);
        if tokio::fs::try_exists(&app_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&app_dir).await?;
        }
        tokio::fs::rename(&staging, &app_dir).await?;

        let mut manifest = progress.last().with_state(AppState::Ready);
        manifest.name = package.name;
        manifest.version = package.version;
        manifest.icon = package.icon;
        manifest.description = package.description;
        manifest.source = source.to_owned();
        manifest.error = None;
        Ok(manifest)
    }

    async fn unpack_and_read(
        &self,
        key: &AppKey,
        bytes: Bytes,
        staging: &Path,
    ) -> Result<PackageManifest, DomainError> {
        let dest = staging.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_tar_gz(&bytes, &dest))
            .await
            .map_err(|e| DomainError::Storage(format!("unpack task failed: {e}")))??;

        let manifest_file = key.app_type.manifest_file();
        let raw = match tokio::fs::read(staging.join(manifest_file)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DomainError::ManifestNotReachable(format!(
                    "{manifest_file} not found in package"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let package: PackageManifest = serde_json::from_slice(&raw)
            .map_err(|e| DomainError::BadManifest(format!("{manifest_file}: {e}")))?;
        if package.name.trim().is_empty() {
            return Err(DomainError::BadManifest(format!(
                "{manifest_file}: name must not be empty"
            )));
        }
        Ok(package)
    }

    /// Remove the files and record of `key`. Caller holds the lease.
    async fn remove_app(&self, key: &AppKey, manifest: Manifest) -> Result<Manifest, DomainError> {
        let app_dir = self.app_dir(key);
        if tokio::fs::try_exists(&app_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&app_dir).await?;
        }
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DomainError::NotFound(key.slug.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        info!(%key, "application deleted");

        let mut gone = manifest;
        gone.updated_at = Utc::now();
        Ok(gone)
    }
}

#[async_trait]
impl Installer for FsInstaller {
    #[instrument(level = "debug", skip(self, request), fields(key = %request.key, op = %request.operation))]
    async fn prepare(&self, request: &LifecycleRequest) -> Result<Prepared, DomainError> {
        let key = &request.key;
        validate_slug(&key.slug)?;

        // Existence checks run under the lease.
        let lease = self.locks.try_acquire(key)?;
        let previous = self.read_record(key).await?;
        let manifest = match request.operation {
            Operation::Install => {
                let source = request.source.as_deref().ok_or(DomainError::MissingSource)?;
                validate_source(source)?;
                match &previous {
                    Some(m) if m.state != AppState::Errored => {
                        return Err(DomainError::AlreadyExists(key.slug.clone()));
                    }
                    _ => Manifest::pending(key, source, AppState::Installing),
                }
            }
            Operation::Update => {
                if let Some(source) = &request.source {
                    return Err(DomainError::UnsupportedSource(format!(
                        "update does not accept a source ({source})"
                    )));
                }
                let current = previous
                    .as_ref()
                    .ok_or_else(|| DomainError::NotFound(key.slug.clone()))?;
                let mut m = current.with_state(AppState::Upgrading);
                m.error = None;
                m
            }
            Operation::Delete => previous
                .clone()
                .ok_or_else(|| DomainError::NotFound(key.slug.clone()))?,
        };

        Ok(Prepared {
            request: request.clone(),
            manifest,
            previous,
            lease,
        })
    }

    #[instrument(level = "debug", skip_all, fields(key = %prepared.request.key, op = %prepared.request.operation))]
    async fn run(
        &self,
        prepared: Prepared,
        progress: &mut ProgressSink,
    ) -> Result<Manifest, DomainError> {
        let Prepared {
            request,
            manifest,
            previous,
            lease: _lease,
        } = prepared;
        let key = &request.key;

        let source = match request.operation {
            Operation::Install => request.source.clone().ok_or(DomainError::MissingSource)?,
            Operation::Update => manifest.source.clone(),
            Operation::Delete => return self.remove_app(key, manifest).await,
        };

        let mut initial = manifest;
        if let (Operation::Install, Some(prev)) = (request.operation, &previous) {
            // Retrying an errored install keeps the original creation date.
            initial.created_at = prev.created_at;
        }
        self.write_record(key, &initial).await?;

        match self.fetch_and_place(key, &source, progress).await {
            Ok(done) => {
                self.write_record(key, &done).await?;
                info!(%key, version = ?done.version, "application ready");
                Ok(done)
            }
            Err(err) => {
                let errored = progress.last().errored(&err);
                if let Err(write_err) = self.write_record(key, &errored).await {
                    warn!(%key, error = %write_err, "failed to record errored state");
                }
                Err(err)
            }
        }
    }

    #[instrument(level = "debug", skip_all, fields(key = %prepared.request.key))]
    async fn delete(&self, prepared: Prepared) -> Result<Manifest, DomainError> {
        if prepared.request.operation != Operation::Delete {
            return Err(DomainError::Interrupted(format!(
                "{} task cannot be completed as a delete",
                prepared.request.operation
            )));
        }
        let Prepared {
            request,
            manifest,
            lease: _lease,
            ..
        } = prepared;
        self.remove_app(&request.key, manifest).await
    }

    async fn list(&self, tenant: &str, app_type: AppType) -> Result<Vec<Manifest>, DomainError> {
        let dir = self.type_dir(tenant, app_type).join(REGISTRY_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut manifests = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Manifest>(&data) {
                Ok(m) => manifests.push(m),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        manifests.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(manifests)
    }

    async fn icon(&self, key: &AppKey) -> Result<Icon, DomainError> {
        validate_slug(&key.slug)?;
        let manifest = self
            .read_record(key)
            .await?
            .ok_or_else(|| DomainError::NotFound(key.slug.clone()))?;
        let icon = manifest
            .icon
            .ok_or_else(|| DomainError::NotFound(format!("{} has no icon", key.slug)))?;

        let rel = Path::new(icon.trim_start_matches('/'));
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(DomainError::NotFound(format!("icon {icon}")));
        }
        let app_dir = self.app_dir(key);
        let path = app_dir.join(rel);
        let not_found = || DomainError::NotFound(format!("icon {icon}"));

        // Links are never served, whether the icon itself or a directory on its path.
        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(not_found()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        }
        let real = tokio::fs::canonicalize(&path).await?;
        if !real.starts_with(tokio::fs::canonicalize(&app_dir).await?) {
            warn!(%key, icon = %icon, "icon resolves outside the application directory");
            return Err(not_found());
        }
        let bytes = Bytes::from(tokio::fs::read(&real).await?);

        Ok(Icon {
            content_type: content_type_for(rel),
            bytes,
        })
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

async fn remove_dir_quietly(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %dir.display(), error = %e, "failed to remove staging directory");
    }
}
