// Docker Registry V2 API routes
//
// Repository names may contain any number of `/` separated components, so a
// single wildcard route takes everything below /v2/ and the path is split
// from the right on the endpoint keywords.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, RawQuery, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};

use crate::auth::{self, Identity};
use crate::handlers::docker_registry_v2::{self as v2, RegistryQuery};
use crate::handlers::errors::{auth_challenge, API_VERSION, API_VERSION_HEADER};
use crate::registry::{RegistryError, Repository};
use crate::AppState;

/// Endpoint addressed by a path below `/v2/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryRoute {
    Catalog,
    Tags { name: String },
    StartUpload { name: String },
    Upload { name: String, id: String },
    Blob { name: String, digest: String },
    Manifest { name: String, reference: String },
}

impl RegistryRoute {
    /// Classify a path with the `/v2/` prefix already removed.
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.trim_start_matches('/');
        if path == "_catalog" {
            return Some(Self::Catalog);
        }
        if let Some(name) = path.strip_suffix("/tags/list") {
            return non_empty(name).map(|name| Self::Tags { name });
        }
        // Names may themselves contain `blobs` or `manifests` segments.
        let blobs = path.rfind("/blobs/");
        let manifests = path.rfind("/manifests/");
        if let Some(at) = manifests.filter(|at| blobs.map_or(true, |b| *at > b)) {
            let (name, reference) = (&path[..at], &path[at + "/manifests/".len()..]);
            if reference.is_empty() || reference.contains('/') {
                return None;
            }
            return non_empty(name).map(|name| Self::Manifest {
                name,
                reference: reference.to_string(),
            });
        }
        if let Some(at) = blobs {
            let (name, rest) = (&path[..at], &path[at + "/blobs/".len()..]);
            if rest == "uploads" || rest == "uploads/" {
                return non_empty(name).map(|name| Self::StartUpload { name });
            }
            if let Some(id) = rest.strip_prefix("uploads/") {
                if id.contains('/') {
                    return None;
                }
                return non_empty(name).map(|name| Self::Upload { name, id: id.to_string() });
            }
            if rest.is_empty() || rest.contains('/') {
                return None;
            }
            return non_empty(name).map(|name| Self::Blob {
                name,
                digest: rest.to_string(),
            });
        }
        None
    }
}

fn non_empty(name: &str) -> Option<String> {
    (!name.is_empty()).then(|| name.to_string())
}

/// Creates the Docker Registry V2 API router
pub fn docker_registry_v2_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/v2", get(v2::version_check))
        .route("/v2/", get(v2::version_check))
        .route("/v2/*path", any(dispatch))
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn_with_state(state, registry_headers))
}

/// Stamp the protocol version on every response and attach the bearer
/// challenge to 401s.
async fn registry_headers(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
    if response.status() == StatusCode::UNAUTHORIZED {
        if let Some((name, value)) = auth_challenge(&state.config.server.token_realm()) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

fn unsupported_method(method: &Method) -> Result<Response, RegistryError> {
    Err(RegistryError::Unsupported(format!("method {method} is not supported here")))
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(route) = RegistryRoute::parse(&path) else {
        return RegistryError::NameUnknown.into_response();
    };
    let query = RegistryQuery::from_raw(raw_query.as_deref());

    let bearer = headers.typed_get::<Authorization<Bearer>>();
    let identity = match auth::authenticate(state.verifier.as_ref(), bearer.as_ref().map(|b| b.token())) {
        Ok(identity) => identity,
        Err(err) => return err.into_response(),
    };

    match handle(&state, &identity, route, &method, &query, &headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle(
    state: &AppState,
    identity: &Identity,
    route: RegistryRoute,
    method: &Method,
    query: &RegistryQuery,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, RegistryError> {
    let is_head = method == Method::HEAD;
    match route {
        RegistryRoute::Catalog => match *method {
            Method::GET => v2::get_catalog(state, identity, query).await,
            _ => unsupported_method(method),
        },
        RegistryRoute::Tags { name } => {
            let repo = Repository::parse(&name)?;
            match *method {
                Method::GET => v2::list_tags(state, identity, &repo, query).await,
                _ => unsupported_method(method),
            }
        }
        RegistryRoute::StartUpload { name } => {
            let repo = Repository::parse(&name)?;
            match *method {
                Method::POST => v2::start_blob_upload(state, identity, &repo, query, body).await,
                _ => unsupported_method(method),
            }
        }
        RegistryRoute::Upload { name, id } => {
            let repo = Repository::parse(&name)?;
            match *method {
                Method::GET => v2::get_upload_status(state, identity, &repo, &id).await,
                Method::PATCH => v2::upload_blob_chunk(state, identity, &repo, &id, headers, body).await,
                Method::PUT => v2::complete_blob_upload(state, identity, &repo, &id, query, body).await,
                Method::DELETE => v2::cancel_blob_upload(state, identity, &repo, &id).await,
                _ => unsupported_method(method),
            }
        }
        RegistryRoute::Blob { name, digest } => {
            let repo = Repository::parse(&name)?;
            match *method {
                Method::GET | Method::HEAD => v2::get_blob(state, identity, &repo, &digest, is_head).await,
                Method::DELETE => v2::delete_blob(state, identity, &repo, &digest).await,
                _ => unsupported_method(method),
            }
        }
        RegistryRoute::Manifest { name, reference } => {
            let repo = Repository::parse(&name)?;
            match *method {
                Method::GET | Method::HEAD => v2::get_manifest(state, identity, &repo, &reference, is_head).await,
                Method::PUT => v2::put_manifest(state, identity, &repo, &reference, headers, body).await,
                Method::DELETE => v2::delete_manifest(state, identity, &repo, &reference).await,
                _ => unsupported_method(method),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_parse_nested_names() {
        assert_eq!(
            RegistryRoute::parse("alice/tools/app/tags/list"),
            Some(RegistryRoute::Tags { name: "alice/tools/app".into() })
        );
        assert_eq!(
            RegistryRoute::parse(&format!("alice/app/manifests/{DIGEST}")),
            Some(RegistryRoute::Manifest {
                name: "alice/app".into(),
                reference: DIGEST.into()
            })
        );
        assert_eq!(
            RegistryRoute::parse(&format!("alice/app/blobs/{DIGEST}")),
            Some(RegistryRoute::Blob {
                name: "alice/app".into(),
                digest: DIGEST.into()
            })
        );
    }

    #[test]
    fn test_parse_upload_paths() {
        for path in ["alice/app/blobs/uploads/", "alice/app/blobs/uploads"] {
            assert_eq!(
                RegistryRoute::parse(path),
                Some(RegistryRoute::StartUpload { name: "alice/app".into() })
            );
        }
        assert_eq!(
            RegistryRoute::parse("alice/app/blobs/uploads/1234"),
            Some(RegistryRoute::Upload {
                name: "alice/app".into(),
                id: "1234".into()
            })
        );
    }

    #[test]
    fn test_keywords_inside_names() {
        // The rightmost keyword delimits the endpoint
        assert_eq!(
            RegistryRoute::parse("alice/manifests/app/manifests/latest"),
            Some(RegistryRoute::Manifest {
                name: "alice/manifests/app".into(),
                reference: "latest".into()
            })
        );
    }

    #[test]
    fn test_blobs_segment_inside_manifest_name() {
        assert_eq!(
            RegistryRoute::parse("alice/blobs/app/manifests/latest"),
            Some(RegistryRoute::Manifest {
                name: "alice/blobs/app".into(),
                reference: "latest".into()
            })
        );
        assert_eq!(
            RegistryRoute::parse(&format!("alice/manifests/app/blobs/{DIGEST}")),
            Some(RegistryRoute::Blob {
                name: "alice/manifests/app".into(),
                digest: DIGEST.into()
            })
        );
        assert_eq!(
            RegistryRoute::parse("alice/blobs/app/blobs/uploads/"),
            Some(RegistryRoute::StartUpload { name: "alice/blobs/app".into() })
        );
    }

    #[test]
    fn test_unknown_paths() {
        assert_eq!(RegistryRoute::parse("_catalog"), Some(RegistryRoute::Catalog));
        for path in ["", "alice", "/tags/list", "alice/app/blobs/", "alice/app/manifests/", "alice/app/other"] {
            assert_eq!(RegistryRoute::parse(path), None, "{path:?}");
        }
    }
}
