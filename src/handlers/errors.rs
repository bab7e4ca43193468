//! Rendering of registry errors as Docker Registry v2 error responses.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::registry::RegistryError;

pub const API_VERSION_HEADER: &str = "docker-distribution-api-version";
pub const API_VERSION: &str = "registry/2.0";

/// Body of every non-2xx registry response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorDetail>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

/// Status code and protocol error code for an error.
pub fn classify(err: &RegistryError) -> (StatusCode, &'static str) {
    use RegistryError::*;
    match err {
        BlobUnknown => (StatusCode::NOT_FOUND, "BLOB_UNKNOWN"),
        BlobUploadUnknown => (StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN"),
        BlobUploadInvalid(_) => (StatusCode::BAD_REQUEST, "BLOB_UPLOAD_INVALID"),
        OffsetMismatch { .. } => (StatusCode::RANGE_NOT_SATISFIABLE, "BLOB_UPLOAD_INVALID"),
        DigestInvalid(_) => (StatusCode::BAD_REQUEST, "DIGEST_INVALID"),
        ManifestBlobUnknown(_) => (StatusCode::NOT_FOUND, "MANIFEST_BLOB_UNKNOWN"),
        ManifestInvalid(_) => (StatusCode::BAD_REQUEST, "MANIFEST_INVALID"),
        ManifestTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "MANIFEST_INVALID"),
        ManifestUnknown => (StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN"),
        NameInvalid(_) => (StatusCode::BAD_REQUEST, "NAME_INVALID"),
        NameUnknown => (StatusCode::NOT_FOUND, "NAME_UNKNOWN"),
        SizeInvalid(_) => (StatusCode::BAD_REQUEST, "SIZE_INVALID"),
        Unsupported(_) => (StatusCode::NOT_IMPLEMENTED, "UNSUPPORTED"),
        Unauthorized | Denied => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
        QuotaExceeded(_) => (StatusCode::FORBIDDEN, "DENIED"),
        Store(_) | Storage(_) | Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN"),
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let (status, code) = classify(&self);
        let message = if self.is_internal() {
            tracing::error!(error = %self, "Registry request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let mut response = (
            status,
            Json(ErrorResponse {
                errors: vec![ErrorDetail { code, message }],
            }),
        )
            .into_response();
        response
            .headers_mut()
            .insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
        response
    }
}

/// `WWW-Authenticate` challenge pointing clients at the token realm.
pub fn auth_challenge(realm: &str) -> Option<(header::HeaderName, HeaderValue)> {
    let value = format!(r#"Bearer realm="{realm}",service="container_registry",scope="*""#);
    HeaderValue::from_str(&value)
        .ok()
        .map(|value| (header::WWW_AUTHENTICATE, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (RegistryError::BlobUnknown, 404, "BLOB_UNKNOWN"),
            (RegistryError::OffsetMismatch { expected: 5, actual: 0 }, 416, "BLOB_UPLOAD_INVALID"),
            (RegistryError::ManifestTooLarge(10), 413, "MANIFEST_INVALID"),
            (RegistryError::SizeInvalid("x".into()), 400, "SIZE_INVALID"),
            (RegistryError::Unsupported("x".into()), 501, "UNSUPPORTED"),
            (RegistryError::Denied, 401, "UNAUTHORIZED"),
        ];
        for (err, status, code) in cases {
            assert_eq!(classify(&err), (StatusCode::from_u16(status).unwrap(), code));
        }
    }

    #[tokio::test]
    async fn test_internal_errors_hide_details() {
        let response = RegistryError::Storage(anyhow::anyhow!("disk on fire")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[API_VERSION_HEADER], API_VERSION);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["errors"][0]["message"], "internal server error");
    }
}
