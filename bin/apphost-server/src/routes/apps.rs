//! Lifecycle routes for webapps (`/apps`) and konnectors (`/konnectors`).
//!
//! Every handler authorizes first, then hands the request to the
//! coordinator. Install and update answer in one of two ways depending on
//! the `Accept` header: `202 Accepted` with the first snapshot, or a live
//! `text/event-stream` of `state` events ending with the final state or an
//! `error` event. Delete and list are synchronous.

use std::sync::Arc;

use apphost_core::{AppKey, AppType, LifecycleRequest};
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};
use utoipa::{IntoParams, OpenApi};

use crate::delivery::{StreamEvent, accept_and_drain, live_stream, wants_event_stream};
use crate::error::ServerError;
use crate::middleware::{Action, Credentials, Resource, Tenant};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        list_webapps,
        install_webapp,
        update_webapp,
        delete_webapp,
        webapp_icon,
        list_konnectors,
        install_konnector,
        update_konnector,
        delete_konnector,
    )
)]
pub struct AppsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/apps/", get(list_webapps))
        .route(
            "/apps/{slug}",
            axum::routing::post(install_webapp)
                .put(update_webapp)
                .delete(delete_webapp),
        )
        .route("/apps/{slug}/icon", get(webapp_icon))
        .route("/konnectors/", get(list_konnectors))
        .route(
            "/konnectors/{slug}",
            axum::routing::post(install_konnector)
                .put(update_konnector)
                .delete(delete_konnector),
        )
}

/// Query string of an install request. Both `Source` and `source` are
/// accepted.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct InstallQuery {
    /// Package location (`https://`, `http://` or `file://` tarball).
    #[serde(rename = "Source", alias = "source")]
    pub source: Option<String>,
}

impl InstallQuery {
    /// The source, with an empty value treated as absent.
    fn into_source(self) -> Option<String> {
        self.source.filter(|s| !s.trim().is_empty())
    }
}

/// Bounded so the stream loop waits for each event to be taken by the
/// response body before reading the next snapshot.
const STREAM_BUFFER: usize = 1;

// ── Dispatch ──────────────────────────────────────────────────────────────────

async fn list(
    state: &AppState,
    credentials: &Credentials,
    tenant: &Tenant,
    app_type: AppType,
) -> Result<Json<Value>, ServerError> {
    state
        .authorizer
        .authorize(credentials, Action::Get, &Resource::Type(app_type))?;
    let manifests = state.coordinator.list(tenant.as_str(), app_type).await?;
    Ok(Json(json!({ "data": manifests })))
}

/// Install or update: create the task, start it, and deliver its progress.
async fn run_lifecycle(
    state: &AppState,
    credentials: &Credentials,
    headers: &HeaderMap,
    action: Action,
    request: LifecycleRequest,
) -> Result<Response, ServerError> {
    state.authorizer.authorize(
        credentials,
        action,
        &Resource::Instance(request.key.clone()),
    )?;

    let streaming = wants_event_stream(headers);
    let coordinator = &state.coordinator;
    let mut task = coordinator.create(request).await?;
    coordinator.start(&mut task);
    info!(task = %task.id(), key = %task.key(), op = %task.operation(), streaming, "lifecycle task started");

    if streaming {
        let (mut tx, rx) = mpsc::channel::<StreamEvent>(STREAM_BUFFER);
        let label = task.key().to_string();
        coordinator.registry().spawn("stream", label, async move {
            let outcome = live_stream(task, &mut tx).await;
            debug!(?outcome, "event stream closed");
        });
        let events = ReceiverStream::new(rx).map(StreamEvent::into_sse);
        return Ok(Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let accepted = accept_and_drain(task, coordinator.registry()).await;
    if let Some(drain) = &accepted.drain {
        debug!(drain = %drain.id(), "draining remaining snapshots in background");
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": accepted.snapshot.manifest })),
    )
        .into_response())
}

async fn delete(
    state: &AppState,
    credentials: &Credentials,
    key: AppKey,
) -> Result<Json<Value>, ServerError> {
    state
        .authorizer
        .authorize(credentials, Action::Delete, &Resource::Instance(key.clone()))?;
    let task = state
        .coordinator
        .create(LifecycleRequest::delete(key))
        .await?;
    let manifest = state.coordinator.delete(task).await?;
    Ok(Json(json!({ "data": manifest })))
}

// ── Webapps ───────────────────────────────────────────────────────────────────

/// List the tenant's webapps.
#[utoipa::path(
    get,
    path = "/apps/",
    tag = "apps",
    responses(
        (status = 200, description = "Installed webapps", body = Value),
        (status = 401, description = "Missing or invalid token"),
    )
)]
pub async fn list_webapps(
    State(state): State<Arc<AppState>>,
    credentials: Credentials,
    tenant: Tenant,
) -> Result<Json<Value>, ServerError> {
    list(&state, &credentials, &tenant, AppType::Webapp).await
}

/// Install a webapp from a package source.
///
/// Send `Accept: text/event-stream` to follow the installation live.
#[utoipa::path(
    post,
    path = "/apps/{slug}",
    tag = "apps",
    params(("slug" = String, Path, description = "Application slug"), InstallQuery),
    responses(
        (status = 200, description = "Live `text/event-stream` of state events"),
        (status = 202, description = "Installation accepted", body = Value),
        (status = 400, description = "Missing source"),
        (status = 409, description = "Already installed or busy"),
        (status = 422, description = "Invalid slug or source"),
    )
)]
pub async fn install_webapp(
    State(state): State<Arc<AppState>>,
    credentials: Credentials,
    tenant: Tenant,
    headers: HeaderMap,
    Path(slug): Path<String>,
    Query(q): Query<InstallQuery>,
) -> Result<Response, ServerError> {
    let key = AppKey::new(tenant.0, slug, AppType::Webapp);
    run_lifecycle(
        &state,
        &credentials,
        &headers,
        Action::Post,
        LifecycleRequest::install(key, q.into_source()),
    )
    .await
}

/// Update an installed webapp from its recorded source.
#[utoipa::path(
    put,
    path = "/apps/{slug}",
    tag = "apps",
    params(("slug" = String, Path, description = "Application slug")),
    responses(
        (status = 200, description = "Live `text/event-stream` of state events"),
        (status = 202, description = "Update accepted", body = Value),
        (status = 404, description = "Not installed"),
        (status = 409, description = "Busy"),
    )
)]
pub async fn update_webapp(
    State(state): State<Arc<AppState>>,
    credentials: Credentials,
    tenant: Tenant,
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> Result<Response, ServerError> {
    let key = AppKey::new(tenant.0, slug, AppType::Webapp);
    run_lifecycle(
        &state,
        &credentials,
        &headers,
        Action::Put,
        LifecycleRequest::update(key),
    )
    .await
}

/// Uninstall a webapp.
#[utoipa::path(
    delete,
    path = "/apps/{slug}",
    tag = "apps",
    params(("slug" = String, Path, description = "Application slug")),
    responses(
        (status = 200, description = "Removed; last manifest", body = Value),
        (status = 404, description = "Not installed"),
    )
)]
pub async fn delete_webapp(
    State(state): State<Arc<AppState>>,
    credentials: Credentials,
    tenant: Tenant,
    Path(slug): Path<String>,
) -> Result<Json<Value>, ServerError> {
    delete(&state, &credentials, AppKey::new(tenant.0, slug, AppType::Webapp)).await
}

/// Serve the icon declared by a webapp's manifest.
#[utoipa::path(
    get,
    path = "/apps/{slug}/icon",
    tag = "apps",
    params(("slug" = String, Path, description = "Application slug")),
    responses(
        (status = 200, description = "Icon bytes"),
        (status = 404, description = "No such app or icon"),
    )
)]
pub async fn webapp_icon(
    State(state): State<Arc<AppState>>,
    credentials: Credentials,
    tenant: Tenant,
    Path(slug): Path<String>,
) -> Result<Response, ServerError> {
    let key = AppKey::new(tenant.0, slug, AppType::Webapp);
    state
        .authorizer
        .authorize(&credentials, Action::Get, &Resource::Instance(key.clone()))?;
    let icon = state.coordinator.icon(&key).await?;
    Ok(([(CONTENT_TYPE, icon.content_type)], icon.bytes).into_response())
}

// ── Konnectors ────────────────────────────────────────────────────────────────

/// List the tenant's konnectors.
#[utoipa::path(
    get,
    path = "/konnectors/",
    tag = "konnectors",
    responses(
        (status = 200, description = "Installed konnectors", body = Value),
        (status = 401, description = "Missing or invalid token"),
    )
)]
pub async fn list_konnectors(
    State(state): State<Arc<AppState>>,
    credentials: Credentials,
    tenant: Tenant,
) -> Result<Json<Value>, ServerError> {
    list(&state, &credentials, &tenant, AppType::Konnector).await
}

/// Install a konnector from a package source.
#[utoipa::path(
    post,
    path = "/konnectors/{slug}",
    tag = "konnectors",
    params(("slug" = String, Path, description = "Konnector slug"), InstallQuery),
    responses(
        (status = 200, description = "Live `text/event-stream` of state events"),
        (status = 202, description = "Installation accepted", body = Value),
        (status = 409, description = "Already installed or busy"),
        (status = 422, description = "Invalid slug or source"),
    )
)]
pub async fn install_konnector(
    State(state): State<Arc<AppState>>,
    credentials: Credentials,
    tenant: Tenant,
    headers: HeaderMap,
    Path(slug): Path<String>,
    Query(q): Query<InstallQuery>,
) -> Result<Response, ServerError> {
    let key = AppKey::new(tenant.0, slug, AppType::Konnector);
    run_lifecycle(
        &state,
        &credentials,
        &headers,
        Action::Post,
        LifecycleRequest::install(key, q.into_source()),
    )
    .await
}

/// Update an installed konnector.
#[utoipa::path(
    put,
    path = "/konnectors/{slug}",
    tag = "konnectors",
    params(("slug" = String, Path, description = "Konnector slug")),
    responses(
        (status = 200, description = "Live `text/event-stream` of state events"),
        (status = 202, description = "Update accepted", body = Value),
        (status = 404, description = "Not installed"),
    )
)]
pub async fn update_konnector(
    State(state): State<Arc<AppState>>,
    credentials: Credentials,
    tenant: Tenant,
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> Result<Response, ServerError> {
    let key = AppKey::new(tenant.0, slug, AppType::Konnector);
    run_lifecycle(
        &state,
        &credentials,
        &headers,
        Action::Put,
        LifecycleRequest::update(key),
    )
    .await
}

/// Uninstall a konnector.
#[utoipa::path(
    delete,
    path = "/konnectors/{slug}",
    tag = "konnectors",
    params(("slug" = String, Path, description = "Konnector slug")),
    responses(
        (status = 200, description = "Removed; last manifest", body = Value),
        (status = 404, description = "Not installed"),
    )
)]
pub async fn delete_konnector(
    State(state): State<Arc<AppState>>,
    credentials: Credentials,
    tenant: Tenant,
    Path(slug): Path<String>,
) -> Result<Json<Value>, ServerError> {
    delete(&state, &credentials, AppKey::new(tenant.0, slug, AppType::Konnector)).await
}
