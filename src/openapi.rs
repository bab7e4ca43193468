use utoipa::OpenApi;

use crate::handlers::{docker_registry_v2, errors, health};

/// Generate the OpenAPI documentation for the entire API
#[derive(OpenApi)]
#[openapi(
    paths(
        // Health endpoints
        health::check,

        // Docker Registry V2 endpoints
        docker_registry_v2::version_check,
        docker_registry_v2::get_catalog,
        docker_registry_v2::list_tags,
        docker_registry_v2::start_blob_upload,
        docker_registry_v2::get_upload_status,
        docker_registry_v2::upload_blob_chunk,
        docker_registry_v2::complete_blob_upload,
        docker_registry_v2::cancel_blob_upload,
        docker_registry_v2::get_blob,
        docker_registry_v2::delete_blob,
        docker_registry_v2::get_manifest,
        docker_registry_v2::put_manifest,
        docker_registry_v2::delete_manifest,
    ),
    components(
        schemas(
            health::HealthResponse,
            docker_registry_v2::CatalogResponse,
            docker_registry_v2::TagListResponse,
            errors::ErrorResponse,
            errors::ErrorDetail,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "docker-registry-v2", description = "OCI Distribution endpoints"),
    )
)]
pub struct ApiDoc;
