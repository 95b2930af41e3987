//! apphost-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev),
//!    optionally mirrored to a daily rolling file.
//! 3. Build the filesystem installer, the task registry and the coordinator.
//! 4. Build the Axum router and serve with graceful shutdown.
//! 5. Drain background lifecycle work before exiting.

mod config;
mod delivery;
mod error;
mod middleware;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use apphost_core::{Coordinator, Fetcher, FsInstaller, TaskRegistry};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::Config;
use crate::middleware::TokenAuthorizer;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let _log_guard = init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "apphost-server starting");

    // ── 3. Lifecycle core ──────────────────────────────────────────────────────
    tokio::fs::create_dir_all(&cfg.storage_root).await?;
    info!(storage_root = %cfg.storage_root.display(), "storage ready");

    let fetcher = Fetcher::new(cfg.fetch_timeout)?.with_max_size(cfg.max_package_size);
    let installer = FsInstaller::new(&cfg.storage_root, fetcher);
    let registry = TaskRegistry::new();
    let coordinator = Coordinator::new(Arc::new(installer), registry.clone());

    let state = Arc::new(AppState {
        authorizer: Arc::new(TokenAuthorizer::new(
            cfg.admin_token.clone(),
            cfg.read_token.clone(),
        )),
        config: Arc::new(cfg.clone()),
        coordinator,
    });

    // ── 4. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── 5. Background work ─────────────────────────────────────────────────────
    if !registry.shutdown(cfg.shutdown_grace).await {
        warn!(
            remaining = registry.len(),
            "shutdown grace period elapsed with lifecycle work still running"
        );
    }

    info!("apphost-server stopped");
    Ok(())
}

/// Install the global subscriber. The returned guard flushes the log file
/// on drop, so it must live until the end of `main`.
fn init_tracing(cfg: &Config) -> Option<WorkerGuard> {
    // RUST_LOG wins; then APPHOST_LOG; an invalid filter falls back to `info`.
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: APPHOST_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                EnvFilter::new("info")
            }
        },
    };

    let stdout = fmt::layer().with_target(true).with_thread_ids(true);
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![if cfg.log_json {
        stdout.json().boxed()
    } else {
        stdout.boxed()
    }];

    let guard = cfg.log_dir.as_ref().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "apphost-server.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed(),
        );
        guard
    });

    tracing_subscriber::registry()
        .with(layers.with_filter(env_filter))
        .init();
    guard
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
