// Docker Registry V2 / OCI Distribution API handlers
// Reference: https://docs.docker.com/registry/spec/api/

use axum::{
    body::Body,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::instrument;
use utoipa::{IntoParams, ToSchema};

use crate::auth::{self, Action, Identity};
use crate::database::FileSearchOptions;
use crate::handlers::errors::{ErrorResponse, API_VERSION, API_VERSION_HEADER};
use crate::registry::digest::InvalidIdentifier;
use crate::registry::{oci, Digest, Reference, RegistryError, RegistryResult, Repository};
use crate::AppState;

pub type HandlerResult = Result<Response, RegistryError>;

const CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
const UPLOAD_UUID_HEADER: &str = "docker-upload-uuid";

/// Catalog pages never hold more than this many repositories.
const MAX_CATALOG_PAGE: i64 = 100;

/// Repository catalog response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CatalogResponse {
    pub repositories: Vec<String>,
}

/// Tag list response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TagListResponse {
    pub name: String,
    pub tags: Vec<String>,
}

/// Query parameters understood by the registry endpoints
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RegistryQuery {
    /// Page size for tag and catalog listings
    pub n: Option<i64>,
    /// Last entry of the previous page
    pub last: Option<String>,
    /// Digest of the content of a monolithic or final upload
    pub digest: Option<String>,
    /// Digest of a blob to mount from another repository
    pub mount: Option<String>,
    /// Repository to mount from
    pub from: Option<String>,
}

impl RegistryQuery {
    /// Parse a raw query string. Empty values count as absent and a page
    /// size that is not a number is ignored.
    pub fn from_raw(raw: Option<&str>) -> Self {
        let mut query = Self::default();
        let pairs = url::form_urlencoded::parse(raw.unwrap_or_default().as_bytes());
        for (key, value) in pairs {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "n" => query.n = value.parse().ok(),
                "last" => query.last = Some(value.to_string()),
                "digest" => query.digest = Some(value.to_string()),
                "mount" => query.mount = Some(value.to_string()),
                "from" => query.from = Some(value.to_string()),
                _ => {}
            }
        }
        query
    }
}

fn location(value: String) -> (header::HeaderName, String) {
    (header::LOCATION, value)
}

/// `Range` value for an upload holding `size` bytes.
pub fn upload_range(size: i64) -> String {
    if size <= 0 {
        "0-0".to_string()
    } else {
        format!("0-{}", size - 1)
    }
}

/// `Link` header pointing at the next page of a listing.
pub fn next_link(path: &str, last: &str, n: i64) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("last", last)
        .append_pair("n", &n.to_string())
        .finish();
    format!("<{path}?{query}>; rel=\"next\"")
}

/// Start offset of a `Content-Range: <start>-<end>` header.
pub fn parse_content_range(value: &str) -> RegistryResult<i64> {
    let invalid = || RegistryError::BlobUploadInvalid(format!("Content-Range {value:?} is invalid"));
    let range = value.trim().trim_start_matches("bytes=");
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start: i64 = start.trim().parse().map_err(|_| invalid())?;
    let end: i64 = end.trim().parse().map_err(|_| invalid())?;
    if start < 0 || end < start {
        return Err(invalid());
    }
    Ok(start)
}

fn parse_digest(value: &str) -> RegistryResult<Digest> {
    value
        .parse()
        .map_err(|err: InvalidIdentifier| RegistryError::DigestInvalid(err.to_string()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn read_manifest_body(body: Body, limit: usize) -> RegistryResult<Bytes> {
    let mut stream = body.into_data_stream();
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| RegistryError::ManifestInvalid(format!("Failed to read body: {err}")))?;
        if buffer.len() + chunk.len() > limit {
            return Err(RegistryError::ManifestTooLarge(limit));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// Docker Registry V2 version check - GET /v2/
#[utoipa::path(
    get,
    path = "/v2/",
    tag = "docker-registry-v2",
    responses(
        (status = 200, description = "Registry speaks the v2 protocol"),
    )
)]
pub async fn version_check() -> impl IntoResponse {
    (StatusCode::OK, [(API_VERSION_HEADER, API_VERSION)], Json(json!({})))
}

/// Get repository catalog - GET /v2/_catalog
#[utoipa::path(
    get,
    path = "/v2/_catalog",
    tag = "docker-registry-v2",
    params(RegistryQuery),
    responses(
        (status = 200, description = "Repository catalog", body = CatalogResponse),
        (status = 401, description = "Authentication required", body = ErrorResponse),
    )
)]
pub async fn get_catalog(state: &AppState, identity: &Identity, query: &RegistryQuery) -> HandlerResult {
    auth::authorize_catalog(identity, state.config.auth.allow_anonymous_pull)?;

    let n = match query.n {
        Some(n) if n > 0 && n <= MAX_CATALOG_PAGE => n,
        _ => MAX_CATALOG_PAGE,
    };
    let last = query.last.as_deref().unwrap_or_default();
    let repositories = state.registry.list_repositories(last, n).await?;

    let mut response = Json(CatalogResponse {
        repositories: repositories.clone(),
    })
    .into_response();
    if repositories.len() as i64 == n {
        if let Some(last) = repositories.last() {
            insert_header(&mut response, header::LINK, next_link("/v2/_catalog", last, n));
        }
    }
    Ok(response)
}

/// List tags - GET /v2/{name}/tags/list
#[utoipa::path(
    get,
    path = "/v2/{name}/tags/list",
    tag = "docker-registry-v2",
    params(
        ("name" = String, Path, description = "Repository name, owner first"),
        RegistryQuery,
    ),
    responses(
        (status = 200, description = "Tags of the repository", body = TagListResponse),
        (status = 404, description = "Repository unknown", body = ErrorResponse),
    )
)]
#[instrument(skip(state, identity, query), fields(repository = %repo))]
pub async fn list_tags(state: &AppState, identity: &Identity, repo: &Repository, query: &RegistryQuery) -> HandlerResult {
    auth::authorize(identity, repo, Action::Pull, state.config.auth.allow_anonymous_pull)?;

    let last = query.last.as_deref().unwrap_or_default();
    let tags = state.registry.list_tags(repo, last, query.n).await?;

    let mut response = Json(TagListResponse {
        name: repo.full_name(),
        tags: tags.clone(),
    })
    .into_response();
    if let Some(n) = query.n.filter(|n| *n > 0) {
        if tags.len() as i64 == n {
            if let Some(last) = tags.last() {
                let path = format!("/v2/{}/tags/list", repo.full_name());
                insert_header(&mut response, header::LINK, next_link(&path, last, n));
            }
        }
    }
    Ok(response)
}

/// Start a blob upload - POST /v2/{name}/blobs/uploads/
#[utoipa::path(
    post,
    path = "/v2/{name}/blobs/uploads/",
    tag = "docker-registry-v2",
    params(
        ("name" = String, Path, description = "Repository name, owner first"),
        RegistryQuery,
    ),
    responses(
        (status = 201, description = "Blob mounted or uploaded in one request"),
        (status = 202, description = "Upload session started"),
        (status = 400, description = "Invalid digest", body = ErrorResponse),
    )
)]
#[instrument(skip(state, identity, query, body), fields(repository = %repo))]
pub async fn start_blob_upload(
    state: &AppState,
    identity: &Identity,
    repo: &Repository,
    query: &RegistryQuery,
    body: Body,
) -> HandlerResult {
    auth::authorize(identity, repo, Action::Push, state.config.auth.allow_anonymous_pull)?;
    let registry = &state.registry;

    if let (Some(mount), Some(from)) = (query.mount.as_deref(), query.from.as_deref()) {
        let digest = parse_digest(mount)?;
        if let Ok(source) = Repository::parse(from) {
            let readable = auth::authorize(identity, &source, Action::Pull, state.config.auth.allow_anonymous_pull).is_ok();
            if readable && registry.mount_blob(repo, identity.name(), &source.full_name(), &digest).await? {
                return Ok(blob_created(repo, &digest));
            }
        }
    }

    if let Some(digest) = query.digest.as_deref() {
        let digest = parse_digest(digest)?;
        let buffer = registry.spool_body(body.into_data_stream()).await?;
        registry
            .finish_monolithic_upload(repo, identity.name(), buffer, &digest)
            .await?;
        return Ok(blob_created(repo, &digest));
    }

    let upload = registry.create_upload().await?;
    Ok((
        StatusCode::ACCEPTED,
        [
            location(format!("/v2/{}/blobs/uploads/{}", repo.full_name(), upload.id)),
            (header::RANGE, upload_range(0)),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
        [(UPLOAD_UUID_HEADER, upload.id)],
    )
        .into_response())
}

fn blob_created(repo: &Repository, digest: &Digest) -> Response {
    (
        StatusCode::CREATED,
        [
            location(format!("/v2/{}/blobs/{}", repo.full_name(), digest)),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
        [(CONTENT_DIGEST_HEADER, digest.to_string())],
    )
        .into_response()
}

fn upload_accepted(repo: &Repository, id: &str, size: i64, status: StatusCode) -> Response {
    (
        status,
        [
            location(format!("/v2/{}/blobs/uploads/{}", repo.full_name(), id)),
            (header::RANGE, upload_range(size)),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
        [(UPLOAD_UUID_HEADER, id.to_string())],
    )
        .into_response()
}

/// Upload progress - GET /v2/{name}/blobs/uploads/{uuid}
#[utoipa::path(
    get,
    path = "/v2/{name}/blobs/uploads/{uuid}",
    tag = "docker-registry-v2",
    params(
        ("name" = String, Path, description = "Repository name, owner first"),
        ("uuid" = String, Path, description = "Upload session id"),
    ),
    responses(
        (status = 204, description = "Bytes received so far, in the Range header"),
        (status = 404, description = "Upload unknown", body = ErrorResponse),
    )
)]
pub async fn get_upload_status(state: &AppState, identity: &Identity, repo: &Repository, id: &str) -> HandlerResult {
    auth::authorize(identity, repo, Action::Push, state.config.auth.allow_anonymous_pull)?;
    let size = state.registry.upload_size(id).await?;
    Ok(upload_accepted(repo, id, size, StatusCode::NO_CONTENT))
}

/// Append a chunk - PATCH /v2/{name}/blobs/uploads/{uuid}
#[utoipa::path(
    patch,
    path = "/v2/{name}/blobs/uploads/{uuid}",
    tag = "docker-registry-v2",
    params(
        ("name" = String, Path, description = "Repository name, owner first"),
        ("uuid" = String, Path, description = "Upload session id"),
    ),
    responses(
        (status = 202, description = "Chunk accepted"),
        (status = 400, description = "Malformed or missing Content-Range", body = ErrorResponse),
        (status = 416, description = "Chunk does not start at the current offset", body = ErrorResponse),
    )
)]
#[instrument(skip(state, identity, headers, body), fields(repository = %repo))]
pub async fn upload_blob_chunk(
    state: &AppState,
    identity: &Identity,
    repo: &Repository,
    id: &str,
    headers: &HeaderMap,
    body: Body,
) -> HandlerResult {
    auth::authorize(identity, repo, Action::Push, state.config.auth.allow_anonymous_pull)?;

    let _guard = state.upload_locks.acquire(id).await;
    let mut uploader = state.registry.open_upload(id).await?;

    let content_range =
        header_str(headers, header::CONTENT_RANGE).filter(|range| !range.trim().is_empty());
    let offset = match content_range {
        Some(range) => parse_content_range(range)?,
        None if uploader.size() != 0 => {
            return Err(RegistryError::BlobUploadInvalid(
                "Stream uploads after first write are not allowed".to_string(),
            ));
        }
        None => 0,
    };

    state
        .registry
        .append_upload(&mut uploader, offset, body.into_data_stream())
        .await?;
    Ok(upload_accepted(repo, id, uploader.size(), StatusCode::ACCEPTED))
}

/// Finish an upload - PUT /v2/{name}/blobs/uploads/{uuid}?digest=...
#[utoipa::path(
    put,
    path = "/v2/{name}/blobs/uploads/{uuid}",
    tag = "docker-registry-v2",
    params(
        ("name" = String, Path, description = "Repository name, owner first"),
        ("uuid" = String, Path, description = "Upload session id"),
        RegistryQuery,
    ),
    responses(
        (status = 201, description = "Blob stored"),
        (status = 400, description = "Missing or mismatching digest", body = ErrorResponse),
    )
)]
#[instrument(skip(state, identity, query, body), fields(repository = %repo))]
pub async fn complete_blob_upload(
    state: &AppState,
    identity: &Identity,
    repo: &Repository,
    id: &str,
    query: &RegistryQuery,
    body: Body,
) -> HandlerResult {
    auth::authorize(identity, repo, Action::Push, state.config.auth.allow_anonymous_pull)?;

    let digest = query
        .digest
        .as_deref()
        .ok_or_else(|| RegistryError::DigestInvalid("digest parameter missing".to_string()))
        .and_then(parse_digest)?;

    let _guard = state.upload_locks.acquire(id).await;
    let mut uploader = state.registry.open_upload(id).await?;
    let offset = uploader.size();
    state
        .registry
        .append_upload(&mut uploader, offset, body.into_data_stream())
        .await?;

    state
        .registry
        .finish_upload(repo, identity.name(), uploader, &digest)
        .await?;
    Ok(blob_created(repo, &digest))
}

/// Cancel an upload - DELETE /v2/{name}/blobs/uploads/{uuid}
#[utoipa::path(
    delete,
    path = "/v2/{name}/blobs/uploads/{uuid}",
    tag = "docker-registry-v2",
    params(
        ("name" = String, Path, description = "Repository name, owner first"),
        ("uuid" = String, Path, description = "Upload session id"),
    ),
    responses(
        (status = 204, description = "Upload cancelled"),
        (status = 404, description = "Upload unknown", body = ErrorResponse),
    )
)]
pub async fn cancel_blob_upload(state: &AppState, identity: &Identity, repo: &Repository, id: &str) -> HandlerResult {
    auth::authorize(identity, repo, Action::Push, state.config.auth.allow_anonymous_pull)?;
    let _guard = state.upload_locks.acquire(id).await;
    state.registry.cancel_upload(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Fetch a blob - GET/HEAD /v2/{name}/blobs/{digest}
#[utoipa::path(
    get,
    path = "/v2/{name}/blobs/{digest}",
    tag = "docker-registry-v2",
    params(
        ("name" = String, Path, description = "Repository name, owner first"),
        ("digest" = String, Path, description = "Content digest, sha256:<hex>"),
    ),
    responses(
        (status = 200, description = "Blob content"),
        (status = 404, description = "Blob unknown", body = ErrorResponse),
    )
)]
#[instrument(skip(state, identity), fields(repository = %repo))]
pub async fn get_blob(state: &AppState, identity: &Identity, repo: &Repository, digest: &str, head: bool) -> HandlerResult {
    auth::authorize(identity, repo, Action::Pull, state.config.auth.allow_anonymous_pull)?;

    let digest: Digest = digest.parse().map_err(|_| RegistryError::BlobUnknown)?;
    let opts = FileSearchOptions::for_repository(repo).with_digest(&digest);
    let descriptor = state
        .registry
        .find_stored(&opts)
        .await?
        .ok_or(RegistryError::BlobUnknown)?;

    let headers = (
        [
            (header::CONTENT_LENGTH, descriptor.blob.size.to_string()),
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        ],
        [(CONTENT_DIGEST_HEADER, digest.to_string())],
    );
    if head {
        return Ok((StatusCode::OK, headers).into_response());
    }

    let reader = state.registry.open_blob(&descriptor).await?;
    Ok((StatusCode::OK, headers, Body::from_stream(ReaderStream::new(reader))).into_response())
}

/// Delete a blob - DELETE /v2/{name}/blobs/{digest}
#[utoipa::path(
    delete,
    path = "/v2/{name}/blobs/{digest}",
    tag = "docker-registry-v2",
    params(
        ("name" = String, Path, description = "Repository name, owner first"),
        ("digest" = String, Path, description = "Content digest, sha256:<hex>"),
    ),
    responses(
        (status = 202, description = "Blob removed from the repository"),
        (status = 404, description = "Blob unknown", body = ErrorResponse),
    )
)]
pub async fn delete_blob(state: &AppState, identity: &Identity, repo: &Repository, digest: &str) -> HandlerResult {
    auth::authorize(identity, repo, Action::Push, state.config.auth.allow_anonymous_pull)?;
    let digest: Digest = digest.parse().map_err(|_| RegistryError::BlobUnknown)?;
    state.registry.delete_blob(repo, &digest).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

/// Fetch a manifest - GET/HEAD /v2/{name}/manifests/{reference}
#[utoipa::path(
    get,
    path = "/v2/{name}/manifests/{reference}",
    tag = "docker-registry-v2",
    params(
        ("name" = String, Path, description = "Repository name, owner first"),
        ("reference" = String, Path, description = "Tag or digest"),
    ),
    responses(
        (status = 200, description = "Manifest document"),
        (status = 404, description = "Manifest unknown", body = ErrorResponse),
    )
)]
#[instrument(skip(state, identity), fields(repository = %repo))]
pub async fn get_manifest(
    state: &AppState,
    identity: &Identity,
    repo: &Repository,
    reference: &str,
    head: bool,
) -> HandlerResult {
    auth::authorize(identity, repo, Action::Pull, state.config.auth.allow_anonymous_pull)?;

    let reference: Reference = reference.parse().map_err(|_| RegistryError::ManifestUnknown)?;
    let descriptor = state.registry.find_manifest(repo, &reference).await?;
    let digest = descriptor.digest();

    let headers = (
        [
            (
                header::CONTENT_TYPE,
                descriptor
                    .media_type()
                    .unwrap_or(oci::MEDIA_TYPE_OCI_MANIFEST)
                    .to_string(),
            ),
            (header::CONTENT_LENGTH, descriptor.blob.size.to_string()),
            (header::ETAG, format!("\"{digest}\"")),
        ],
        [(CONTENT_DIGEST_HEADER, digest.clone())],
    );
    if head {
        return Ok((StatusCode::OK, headers).into_response());
    }

    let reader = state.registry.open_blob(&descriptor).await?;
    state.registry.record_download(&descriptor).await?;
    Ok((StatusCode::OK, headers, Body::from_stream(ReaderStream::new(reader))).into_response())
}

/// Push a manifest - PUT /v2/{name}/manifests/{reference}
#[utoipa::path(
    put,
    path = "/v2/{name}/manifests/{reference}",
    tag = "docker-registry-v2",
    params(
        ("name" = String, Path, description = "Repository name, owner first"),
        ("reference" = String, Path, description = "Tag, or digest for an untagged push"),
    ),
    responses(
        (status = 201, description = "Manifest stored"),
        (status = 400, description = "Manifest invalid", body = ErrorResponse),
        (status = 404, description = "Referenced blob unknown", body = ErrorResponse),
        (status = 413, description = "Manifest too large", body = ErrorResponse),
    )
)]
#[instrument(skip(state, identity, headers, body), fields(repository = %repo))]
pub async fn put_manifest(
    state: &AppState,
    identity: &Identity,
    repo: &Repository,
    reference: &str,
    headers: &HeaderMap,
    body: Body,
) -> HandlerResult {
    auth::authorize(identity, repo, Action::Push, state.config.auth.allow_anonymous_pull)?;

    let reference: Reference = reference
        .parse()
        .map_err(|_| RegistryError::ManifestInvalid("Tag is invalid".to_string()))?;
    let body = read_manifest_body(body, state.registry.options().max_manifest_size).await?;
    let content_type = header_str(headers, header::CONTENT_TYPE);

    let digest = state
        .registry
        .process_manifest(repo, &reference, content_type, body, identity.name())
        .await?;

    Ok((
        StatusCode::CREATED,
        [
            location(format!("/v2/{}/manifests/{}", repo.full_name(), reference)),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
        [(CONTENT_DIGEST_HEADER, digest.to_string())],
    )
        .into_response())
}

/// Delete a manifest - DELETE /v2/{name}/manifests/{reference}
#[utoipa::path(
    delete,
    path = "/v2/{name}/manifests/{reference}",
    tag = "docker-registry-v2",
    params(
        ("name" = String, Path, description = "Repository name, owner first"),
        ("reference" = String, Path, description = "Tag or digest"),
    ),
    responses(
        (status = 202, description = "Manifest deleted"),
        (status = 404, description = "Manifest unknown", body = ErrorResponse),
    )
)]
pub async fn delete_manifest(state: &AppState, identity: &Identity, repo: &Repository, reference: &str) -> HandlerResult {
    auth::authorize(identity, repo, Action::Push, state.config.auth.allow_anonymous_pull)?;
    let reference: Reference = reference.parse().map_err(|_| RegistryError::ManifestUnknown)?;
    state.registry.delete_manifest(repo, &reference).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

fn insert_header(response: &mut Response, name: header::HeaderName, value: String) {
    if let Ok(value) = header::HeaderValue::from_str(&value) {
        response.headers_mut().insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_range() {
        assert_eq!(upload_range(0), "0-0");
        assert_eq!(upload_range(1), "0-0");
        assert_eq!(upload_range(1024), "0-1023");
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("0-99").unwrap(), 0);
        assert_eq!(parse_content_range("100-199").unwrap(), 100);
        assert_eq!(parse_content_range("bytes=5-9").unwrap(), 5);
        for bad in ["", "abc", "10", "9-5", "-1-4"] {
            assert!(
                matches!(parse_content_range(bad), Err(RegistryError::BlobUploadInvalid(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_query_values_are_lenient() {
        let query = RegistryQuery::from_raw(Some("n=&last="));
        assert_eq!(query.n, None);
        assert_eq!(query.last, None);

        let query = RegistryQuery::from_raw(Some("n=abc&last=v1.0%2Bbuild&unknown=1"));
        assert_eq!(query.n, None);
        assert_eq!(query.last.as_deref(), Some("v1.0+build"));

        let query = RegistryQuery::from_raw(Some("mount=sha256%3Aabc&from=alice%2Fbase&n=5"));
        assert_eq!(query.n, Some(5));
        assert_eq!(query.mount.as_deref(), Some("sha256:abc"));
        assert_eq!(query.from.as_deref(), Some("alice/base"));

        assert!(RegistryQuery::from_raw(None).digest.is_none());
    }

    #[test]
    fn test_next_link_escapes_values() {
        assert_eq!(
            next_link("/v2/alice/app/tags/list", "v1.0+build", 2),
            "</v2/alice/app/tags/list?last=v1.0%2Bbuild&n=2>; rel=\"next\""
        );
    }
}
