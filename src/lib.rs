use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod auth;
pub mod config;
pub mod database;
pub mod db;
pub mod handlers;
pub mod openapi;
pub mod registry;
pub mod routes;
pub mod storage;

use auth::TokenVerifier;
use registry::uploader::UploadLocks;
use registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Settings>,
    pub registry: Registry,
    pub verifier: Arc<dyn TokenVerifier>,
    pub upload_locks: Arc<UploadLocks>,
}

impl AppState {
    pub fn new(config: config::Settings, registry: Registry, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            verifier,
            upload_locks: Arc::new(UploadLocks::new()),
        }
    }
}

/// Create the main Axum application router
pub fn create_app(state: AppState) -> Router {
    // Register API documentation
    let openapi = openapi::ApiDoc::openapi();

    Router::new()
        // Docker Registry V2 API
        .merge(routes::docker_registry_v2::docker_registry_v2_router(state.clone()))
        // Health and monitoring endpoints
        .merge(routes::health::health_router())
        // Serve Swagger UI
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
