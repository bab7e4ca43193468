#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, Response};
use axum::Router;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use container_registry::auth::{issue_token, JwtTokenVerifier};
use container_registry::config::Settings;
use container_registry::database::MemoryPackageStore;
use container_registry::registry::Registry;
use container_registry::storage::MemoryStorage;
use container_registry::{create_app, AppState};

pub const JWT_SECRET: &str = "integration-test-secret";
pub const APP_URL: &str = "http://registry.test";

/// Settings for a fully in-memory registry, with `overrides` applied on top.
pub fn test_settings(upload_dir: &std::path::Path, overrides: &[(&str, &str)]) -> Settings {
    let mut vars: HashMap<String, String> = [
        ("DATABASE_BACKEND", "memory"),
        ("STORAGE_BACKEND", "memory"),
        ("JWT_SECRET", JWT_SECRET),
        ("APP_URL", APP_URL),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.insert(
        "CHUNKED_UPLOAD_PATH".to_string(),
        upload_dir.to_string_lossy().into_owned(),
    );
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }
    Settings::from_lookup(&|key: &str| vars.get(key).cloned()).expect("test settings are valid")
}

pub struct TestApp {
    pub app: Router,
    pub registry: Registry,
    pub store: MemoryPackageStore,
    pub storage: MemoryStorage,
    _upload_dir: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_env(&[])
    }

    pub fn with_env(overrides: &[(&str, &str)]) -> Self {
        let upload_dir = TempDir::new().expect("temp dir");
        let settings = test_settings(upload_dir.path(), overrides);
        let store = MemoryPackageStore::new();
        let storage = MemoryStorage::new();
        let registry = Registry::new(
            Arc::new(store.clone()),
            Arc::new(storage.clone()),
            settings.registry_options(),
        );
        let verifier = Arc::new(JwtTokenVerifier::new(JWT_SECRET.as_bytes()));
        let app = create_app(AppState::new(settings, registry.clone(), verifier));
        Self {
            app,
            registry,
            store,
            storage,
            _upload_dir: upload_dir,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.expect("router is infallible")
    }

    /// Send a request authenticated as `subject`.
    pub async fn call(&self, method: Method, uri: &str, subject: &str, body: impl Into<Body>) -> Response<Body> {
        self.send(request(method, uri, Some(&token(subject)), body, None)).await
    }

    /// Push `content` as a monolithic blob upload and return its digest.
    pub async fn push_blob(&self, repo: &str, subject: &str, content: &[u8]) -> String {
        let digest = digest_of(content);
        let response = self
            .call(
                Method::POST,
                &format!("/v2/{repo}/blobs/uploads/?digest={digest}"),
                subject,
                Bytes::copy_from_slice(content),
            )
            .await;
        assert_eq!(response.status(), 201, "blob push failed");
        digest
    }

    pub async fn put_manifest(&self, repo: &str, reference: &str, subject: &str, manifest: &serde_json::Value) -> Response<Body> {
        let media_type = manifest["mediaType"]
            .as_str()
            .unwrap_or("application/vnd.oci.image.manifest.v1+json")
            .to_string();
        self.send(request(
            Method::PUT,
            &format!("/v2/{repo}/manifests/{reference}"),
            Some(&token(subject)),
            manifest.to_string(),
            Some(&media_type),
        ))
        .await
    }
}

pub fn token(subject: &str) -> String {
    issue_token(JWT_SECRET.as_bytes(), subject, None, false, chrono::Duration::hours(1)).expect("token signs")
}

pub fn request(
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: impl Into<Body>,
    content_type: Option<&str>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder.body(body.into()).expect("request builds")
}

pub fn digest_of(content: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("sha256:{}", hex::encode(Sha256::digest(content)))
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    to_bytes(response.into_body(), usize::MAX).await.expect("body reads")
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).expect("body is json")
}

pub fn header<'a>(response: &'a Response<Body>, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

/// Image manifest over one config blob and the given layers.
pub fn image_manifest(config: (&str, usize), layers: &[(&str, usize)]) -> serde_json::Value {
    serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config.0,
            "size": config.1,
        },
        "layers": layers
            .iter()
            .map(|(digest, size)| serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": digest,
                "size": size,
            }))
            .collect::<Vec<_>>(),
    })
}

pub const CONFIG: &[u8] = br#"{"os":"linux","architecture":"amd64","config":{"Labels":{"org.opencontainers.image.description":"test image"}}}"#;
