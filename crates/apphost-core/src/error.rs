use thiserror::Error;

/// Errors produced by the installer and the lifecycle coordinator.
///
/// The HTTP layer classifies every variant with an exhaustive `match`; a
/// new variant must be mapped there before the server builds.
///
/// Variants carry owned strings so a terminal snapshot, error included, can
/// be cloned out again on every `next()` after completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// The slug does not follow the naming rule.
    #[error("invalid slug name: {0:?}")]
    InvalidSlug(String),

    /// An application with this slug is already installed.
    #[error("application {0} already exists")]
    AlreadyExists(String),

    /// Another lifecycle task currently holds the key.
    #[error("application {0} is busy with another operation")]
    Busy(String),

    /// The application is not installed.
    #[error("application {0} not found")]
    NotFound(String),

    /// The source locator uses a scheme the installer cannot fetch from,
    /// or a source was given where none is accepted.
    #[error("source is not supported: {0}")]
    UnsupportedSource(String),

    /// The package was fetched but carries no manifest.
    #[error("manifest is not reachable: {0}")]
    ManifestNotReachable(String),

    /// The package could not be fetched.
    #[error("source is not reachable: {0}")]
    SourceNotReachable(String),

    /// The manifest exists but cannot be understood.
    #[error("bad manifest: {0}")]
    BadManifest(String),

    /// An install request came without a source locator.
    #[error("missing source")]
    MissingSource,

    /// The source locator is not a valid URI.
    #[error("malformed source: {0}")]
    MalformedSource(String),

    /// Reading or writing tenant storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The background work ended without reporting a final state.
    #[error("operation interrupted: {0}")]
    Interrupted(String),
}

impl From<std::io::Error> for DomainError {
    fn from(e: std::io::Error) -> Self {
        DomainError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(e: serde_json::Error) -> Self {
        DomainError::Storage(e.to_string())
    }
}
