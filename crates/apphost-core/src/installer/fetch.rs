use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use reqwest::Client;
use tar::{Archive, EntryType};
use tracing::{debug, warn};
use url::Url;

use crate::error::DomainError;

const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "file"];

/// Largest package accepted unless configured otherwise (256 MiB).
pub const DEFAULT_MAX_PACKAGE_SIZE: u64 = 256 * 1024 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Parse a source locator and check that its scheme can be fetched.
pub fn validate_source(raw: &str) -> Result<Url, DomainError> {
    let url = Url::parse(raw).map_err(|e| DomainError::MalformedSource(format!("{raw}: {e}")))?;
    if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
        return Err(DomainError::UnsupportedSource(format!(
            "scheme '{}' (supported: {})",
            url.scheme(),
            SUPPORTED_SCHEMES.join(", ")
        )));
    }
    Ok(url)
}

/// Downloads package archives from `http(s)://` and `file://` locations.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    max_size: u64,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("apphost/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            max_size: DEFAULT_MAX_PACKAGE_SIZE,
        })
    }

    /// Reject packages larger than `bytes`.
    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }

    /// Fetch the raw archive bytes behind `url`.
    pub async fn fetch(&self, url: &Url) -> Result<Bytes, DomainError> {
        debug!(%url, max_size = self.max_size, "fetching package");
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| DomainError::MalformedSource(url.to_string()))?;
                let unreachable =
                    |e: std::io::Error| DomainError::SourceNotReachable(format!("{}: {e}", path.display()));
                let meta = tokio::fs::metadata(&path).await.map_err(unreachable)?;
                self.check_size(meta.len())?;
                let data = tokio::fs::read(&path).await.map_err(unreachable)?;
                Ok(Bytes::from(data))
            }
            "http" | "https" => {
                let unreachable = |e: reqwest::Error| DomainError::SourceNotReachable(e.to_string());
                let mut response = self
                    .client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(unreachable)?
                    .error_for_status()
                    .map_err(unreachable)?;
                if let Some(len) = response.content_length() {
                    self.check_size(len)?;
                }
                let mut body = BytesMut::new();
                while let Some(chunk) = response.chunk().await.map_err(unreachable)? {
                    self.check_size((body.len() + chunk.len()) as u64)?;
                    body.extend_from_slice(&chunk);
                }
                Ok(body.freeze())
            }
            other => Err(DomainError::UnsupportedSource(format!("scheme '{other}'"))),
        }
    }

    fn check_size(&self, size: u64) -> Result<(), DomainError> {
        if size > self.max_size {
            return Err(DomainError::BadManifest(format!(
                "package is larger than {} bytes",
                self.max_size
            )));
        }
        Ok(())
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT).unwrap_or_else(|e| {
            warn!(error = %e, "http client setup failed, using reqwest defaults");
            Self {
                client: Client::new(),
                max_size: DEFAULT_MAX_PACKAGE_SIZE,
            }
        })
    }
}

/// Extract a `.tar.gz` package into `dest`.
///
/// When every entry lives under one top-level directory, that directory is
/// stripped. Only regular files and directories are unpacked: link or device
/// entries and paths with `..`, absolute or prefixed components are rejected.
pub(crate) fn unpack_tar_gz(bytes: &[u8], dest: &Path) -> Result<(), DomainError> {
    let root = common_root(bytes)?;
    let mut archive = Archive::new(GzDecoder::new(Cursor::new(bytes)));

    std::fs::create_dir_all(dest)?;
    let base = dest.canonicalize()?;
    for entry in archive.entries().map_err(bad_package)? {
        let mut entry = entry.map_err(bad_package)?;
        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Directory => {}
            EntryType::XGlobalHeader => continue,
            other => {
                return Err(DomainError::BadManifest(format!(
                    "package entry {} has unsupported type {other:?}",
                    entry.path().map_err(bad_package)?.display()
                )));
            }
        }
        let full_path = entry.path().map_err(bad_package)?.to_path_buf();
        let rel_path = match &root {
            Some(root) => match full_path.strip_prefix(root) {
                Ok(p) => p.to_path_buf(),
                Err(_) => continue,
            },
            None => full_path.clone(),
        };
        if rel_path.as_os_str().is_empty() {
            continue;
        }
        if !rel_path.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(DomainError::BadManifest(format!(
                "package entry escapes the application directory: {}",
                full_path.display()
            )));
        }

        let dest_path = dest.join(rel_path);
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
            if !parent.canonicalize()?.starts_with(&base) {
                return Err(DomainError::BadManifest(format!(
                    "package entry escapes the application directory: {}",
                    full_path.display()
                )));
            }
        }
        entry.unpack(&dest_path)?;
    }
    Ok(())
}

fn common_root(bytes: &[u8]) -> Result<Option<PathBuf>, DomainError> {
    let mut archive = Archive::new(GzDecoder::new(Cursor::new(bytes)));
    let mut root: Option<PathBuf> = None;
    let mut nested = false;

    for entry in archive.entries().map_err(bad_package)? {
        let entry = entry.map_err(bad_package)?;
        let path = entry.path().map_err(bad_package)?.to_path_buf();
        let mut components = path.components().filter(|c| !matches!(c, Component::CurDir));
        let Some(first) = components.next() else {
            continue;
        };
        let first = PathBuf::from(first.as_os_str());
        let has_more = components.next().is_some();
        let is_dir = entry.header().entry_type().is_dir();

        match &root {
            None => root = Some(first),
            Some(r) if *r != first => return Ok(None),
            Some(_) => {}
        }
        if has_more {
            nested = true;
        } else if !is_dir {
            // A plain file at the top level: nothing to strip.
            return Ok(None);
        }
    }

    Ok(if nested { root } else { None })
}

fn bad_package(e: std::io::Error) -> DomainError {
    DomainError::BadManifest(format!("unreadable package archive: {e}"))
}
