use utoipa::OpenApi;

use crate::routes::{apps, health};

#[derive(OpenApi)]
#[openapi(info(
    title = "apphost-server",
    description = "Application lifecycle API: install, update, delete and list webapps and konnectors",
    version = "0.1.0",
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(apps::AppsApi::openapi());
    root
}
