//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - Middleware layers (CORS, per-request trace-ID injection)
//! - Optional Swagger UI / OpenAPI spec endpoint (disable with `APPHOST_ENABLE_SWAGGER=false`)
//! - Health / heartbeat route
//! - `/apps` and `/konnectors` lifecycle routes

mod apps;
pub mod doc;
mod health;

use std::sync::Arc;

use axum::{Router, middleware};
use tower::ServiceBuilder;
use utoipa_swagger_ui::SwaggerUi;

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .merge(health::router())
        .merge(apps::router());

    if state.config.enable_swagger {
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", doc::get_docs()));
    }

    app
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(&state.config)))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::time::Duration;

    use apphost_core::{Coordinator, Fetcher, FsInstaller, Installer, TaskRegistry};
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::middleware::TokenAuthorizer;

    const HOST: &str = "alice.example:8080";

    fn state_with(installer: Arc<dyn Installer>, config: Config) -> Arc<AppState> {
        let authorizer = TokenAuthorizer::new(config.admin_token.clone(), config.read_token.clone());
        Arc::new(AppState {
            config: Arc::new(config),
            coordinator: Coordinator::new(installer, TaskRegistry::new()),
            authorizer: Arc::new(authorizer),
        })
    }

    fn fs_state(storage: &Path) -> Arc<AppState> {
        let installer = FsInstaller::new(storage, Fetcher::default());
        state_with(Arc::new(installer), Config::default())
    }

    fn request(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, HOST)
    }

    async fn send(state: &Arc<AppState>, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, String) {
        let resp = build(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn json(body: &str) -> Value {
        serde_json::from_str(body).unwrap()
    }

    fn package(dir: &Path) -> String {
        let files = [
            ("drive/manifest.webapp", r#"{"name":"Drive","version":"1.0.0","icon":"icon.svg"}"#),
            ("drive/index.html", "<html/>"),
            ("drive/icon.svg", "<svg/>"),
        ];
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, data) in files {
            let mut h = tar::Header::new_gnu();
            h.set_size(data.len() as u64);
            h.set_mode(0o644);
            h.set_cksum();
            builder.append_data(&mut h, path, data.as_bytes()).unwrap();
        }
        let bytes = builder.into_inner().unwrap().finish().unwrap();
        let path = dir.join("drive.tar.gz");
        std::fs::write(&path, bytes).unwrap();
        url::Url::from_file_path(&path).unwrap().to_string()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let storage = tempfile::tempdir().unwrap();
        let state = fs_state(storage.path());
        let (status, headers, body) = send(&state, request("GET", "/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["status"], "ok");
        assert!(headers.contains_key(trace::X_TRACE_ID));
    }

    #[tokio::test]
    async fn unreachable_source_streams_one_bad_request_error() {
        let storage = tempfile::tempdir().unwrap();
        let state = fs_state(storage.path());
        let missing = url::Url::from_file_path(storage.path().join("nowhere/app.tar.gz")).unwrap();

        let req = request("POST", &format!("/apps/foo?Source={missing}"))
            .header(header::ACCEPT, "text/event-stream")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&state, req).await;

        assert_eq!(status, StatusCode::OK);
        assert!(
            headers[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
        assert_eq!(body.matches("event: error").count(), 1, "{body}");
        assert!(body.contains(r#""status":400"#), "{body}");
        let after_error = body.split("event: error").nth(1).unwrap();
        assert!(!after_error.contains("event: state"));
    }

    #[tokio::test]
    async fn install_accepted_then_listed_served_and_deleted() {
        let storage = tempfile::tempdir().unwrap();
        let pkgs = tempfile::tempdir().unwrap();
        let state = fs_state(storage.path());
        let source = package(pkgs.path());

        let req = request("POST", &format!("/apps/drive?source={source}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json(&body)["data"]["slug"], "drive");

        assert!(
            state
                .coordinator
                .registry()
                .shutdown(Duration::from_secs(10))
                .await
        );

        let (status, _, body) = send(&state, request("GET", "/apps/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let listed = json(&body);
        assert_eq!(listed["data"][0]["slug"], "drive");
        assert_eq!(listed["data"][0]["state"], "ready");

        let (_, _, body) = send(&state, request("GET", "/konnectors/").body(Body::empty()).unwrap()).await;
        assert_eq!(json(&body)["data"], Value::Array(vec![]));

        let (status, headers, body) =
            send(&state, request("GET", "/apps/drive/icon").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "image/svg+xml");
        assert_eq!(body, "<svg/>");

        let (status, _, body) = send(&state, request("DELETE", "/apps/drive").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["data"]["slug"], "drive");
    }

    #[tokio::test]
    async fn delete_of_missing_app_is_not_found() {
        let storage = tempfile::tempdir().unwrap();
        let state = fs_state(storage.path());
        let (status, _, body) =
            send(&state, request("DELETE", "/konnectors/bar").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json(&body)["error"].as_str().unwrap().contains("bar"));
        assert!(state.coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn creation_errors_are_classified() {
        let storage = tempfile::tempdir().unwrap();
        let state = fs_state(storage.path());

        let req = request("POST", "/apps/Bad_Slug?Source=https://x/a.tar.gz")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json(&body)["parameter"], "slug");

        // Validation errors are plain HTTP errors even when a stream was asked for.
        let req = request("POST", "/apps/foo")
            .header(header::ACCEPT, "text/event-stream")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = request("PUT", "/apps/foo").body(Body::empty()).unwrap();
        let (status, _, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let req = request("POST", "/apps/foo?Source=git://x/repo.git")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json(&body)["parameter"], "source");
    }

    #[tokio::test]
    async fn tokens_gate_requests() {
        let storage = tempfile::tempdir().unwrap();
        let config = Config {
            admin_token: Some("admin".into()),
            read_token: Some("reader".into()),
            ..Config::default()
        };
        let installer = FsInstaller::new(storage.path(), Fetcher::default());
        let state = state_with(Arc::new(installer), config);

        let (status, _, _) = send(&state, request("GET", "/apps/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = request("GET", "/apps/")
            .header(header::AUTHORIZATION, "Bearer reader")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK);

        let req = request("DELETE", "/apps/drive")
            .header(header::AUTHORIZATION, "Bearer reader")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let req = request("DELETE", "/apps/drive")
            .header(header::AUTHORIZATION, "Bearer admin")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_host_is_rejected() {
        let storage = tempfile::tempdir().unwrap();
        let state = fs_state(storage.path());
        let req = Request::builder()
            .uri("/apps/")
            .header(header::HOST, "../../etc")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let storage = tempfile::tempdir().unwrap();
        let state = fs_state(storage.path());
        let (status, _, body) =
            send(&state, request("GET", "/api-docs/openapi.json").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json(&body)["paths"].get("/apps/{slug}").is_some());
    }
}
