//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use apphost_core::DEFAULT_MAX_PACKAGE_SIZE;

/// Runtime configuration for apphost-server.
///
/// Every field has a default so the server starts without any environment
/// variables set (in development mode, with authorization disabled).
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// Directory holding every tenant's applications (default: `"./data"`).
    pub storage_root: PathBuf,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// When set, logs are also written to a daily rolling file in this
    /// directory.
    pub log_dir: Option<PathBuf>,

    /// Bearer token allowed to perform every operation. Unset disables
    /// authorization entirely.
    pub admin_token: Option<String>,

    /// Bearer token allowed to perform read-only (`GET`) requests.
    pub read_token: Option<String>,

    /// Timeout for one package download.
    pub fetch_timeout: Duration,

    /// Largest package, in bytes, an install or update may download.
    pub max_package_size: u64,

    /// How long shutdown waits for background lifecycle work.
    pub shutdown_grace: Duration,

    /// Comma-separated CORS origins; unset allows any origin.
    pub cors_allowed_origins: Option<String>,

    /// Serve `/swagger-ui` and `/api-docs/openapi.json`.
    pub enable_swagger: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_address: env_or("APPHOST_BIND", &d.bind_address),
            storage_root: env_opt("APPHOST_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.storage_root),
            log_level: env_or("APPHOST_LOG", &d.log_level),
            log_json: parse_flag("APPHOST_LOG_JSON", d.log_json),
            log_dir: env_opt("APPHOST_LOG_DIR").map(PathBuf::from),
            admin_token: env_opt("APPHOST_ADMIN_TOKEN"),
            read_token: env_opt("APPHOST_READ_TOKEN"),
            fetch_timeout: Duration::from_secs(parse_env(
                "APPHOST_FETCH_TIMEOUT_SECS",
                d.fetch_timeout.as_secs(),
            )),
            max_package_size: parse_env("APPHOST_MAX_PACKAGE_BYTES", d.max_package_size),
            shutdown_grace: Duration::from_secs(parse_env(
                "APPHOST_SHUTDOWN_GRACE_SECS",
                d.shutdown_grace.as_secs(),
            )),
            cors_allowed_origins: env_opt("APPHOST_CORS_ORIGINS"),
            enable_swagger: parse_flag("APPHOST_ENABLE_SWAGGER", d.enable_swagger),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".into(),
            storage_root: PathBuf::from("./data"),
            log_level: "info".into(),
            log_json: false,
            log_dir: None,
            admin_token: None,
            read_token: None,
            fetch_timeout: Duration::from_secs(60),
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE,
            shutdown_grace: Duration::from_secs(30),
            cors_allowed_origins: None,
            enable_swagger: true,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
