//! Router and HTTP surface for the Registry v2 subset the proxy serves.

use crate::cache::{Cache, MetadataIndex};
use crate::middleware::{self, RateLimiter};
use crate::registry::{blob, manifest, tags, UpstreamClient};
use crate::singleflight::BlobCoordinator;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<Cache>,
    pub index: Arc<dyn MetadataIndex>,
    pub upstream: Arc<UpstreamClient>,
    pub blobs: Arc<BlobCoordinator>,
    pub cache_ttl: Duration,
    pub tag_cache_ttl: Duration,
}

/// Headers every successful /v2/ response carries.
pub fn v2_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "Docker-Distribution-API-Version",
        "registry/2.0".parse().expect("static header"),
    );
    headers
}

/// A validated /v2/ request target.
#[derive(Debug, PartialEq, Eq)]
pub enum ParsedPath {
    Manifest { image: String, reference: String },
    Blob { image: String, digest: String },
    Tags { image: String },
    Catalog,
}

/// Parse the part of the request path after `/v2/`.
///
/// Segment charset is `[A-Za-z0-9_.:\-/]`; `..` and empty segments are
/// rejected before anything touches the cache or upstream.
pub fn parse_v2_path(path: &str) -> Result<ParsedPath, (StatusCode, &'static str)> {
    let valid_chars = path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-' | '/'));
    if path.is_empty() || !valid_chars {
        return Err((StatusCode::BAD_REQUEST, "Invalid path"));
    }

    if path == "_catalog" {
        return Ok(ParsedPath::Catalog);
    }

    let parts: Vec<&str> = path.split('/').collect();
    if parts.iter().any(|p| p.is_empty() || p.contains("..")) {
        return Err((StatusCode::BAD_REQUEST, "Invalid path component"));
    }
    if parts.len() < 3 {
        return Err((StatusCode::BAD_REQUEST, "Invalid request"));
    }

    let last = parts[parts.len() - 1];
    let second_last = parts[parts.len() - 2];
    let image = parts[..parts.len() - 2].join("/");

    if second_last == "tags" && last == "list" {
        return Ok(ParsedPath::Tags { image });
    }

    match second_last {
        "manifests" => Ok(ParsedPath::Manifest {
            image,
            reference: last.to_string(),
        }),
        "blobs" => {
            if !is_valid_digest(last) {
                return Err((StatusCode::BAD_REQUEST, "Invalid digest format"));
            }
            Ok(ParsedPath::Blob {
                image,
                digest: last.to_string(),
            })
        }
        _ => Err((StatusCode::NOT_FOUND, "Not found")),
    }
}

/// `sha256:` followed by 64 lowercase hex characters.
pub fn is_valid_digest(digest: &str) -> bool {
    match digest.strip_prefix("sha256:") {
        Some(hex) => {
            hex.len() == 64
                && hex
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => false,
    }
}

// Axum path params only match single segments, so multi-segment image
// names are parsed manually off the raw URI
async fn get_v2_wrapper(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path().strip_prefix("/v2/").unwrap_or("");
    tracing::debug!(path = %path, "v2 request");

    match parse_v2_path(path) {
        Ok(ParsedPath::Manifest { image, reference }) => {
            manifest::get_manifest(&state, &image, &reference, &headers).await
        }
        Ok(ParsedPath::Blob { image, digest }) => blob::get_blob(&state, &image, &digest).await,
        Ok(ParsedPath::Tags { image }) => tags::get_tags(&state, &image).await,
        Ok(ParsedPath::Catalog) => catalog().await,
        Err((status, message)) => (status, message).into_response(),
    }
}

async fn head_v2_wrapper(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path().strip_prefix("/v2/").unwrap_or("");

    match parse_v2_path(path) {
        Ok(ParsedPath::Manifest { image, reference }) => {
            manifest::head_manifest(&state, &image, &reference, &headers).await
        }
        Ok(ParsedPath::Blob { image, digest }) => blob::head_blob(&state, &image, &digest).await,
        Ok(ParsedPath::Tags { image }) => tags::get_tags(&state, &image).await,
        Ok(ParsedPath::Catalog) => catalog().await,
        Err((status, message)) => (status, message).into_response(),
    }
}

async fn api_version() -> impl IntoResponse {
    tracing::debug!("GET /v2/ - API version check");
    (StatusCode::OK, v2_headers())
}

async fn catalog() -> Response {
    // The proxy never enumerates upstream repositories
    (
        StatusCode::OK,
        v2_headers(),
        Json(serde_json::json!({ "repositories": [] })),
    )
        .into_response()
}

#[derive(Deserialize)]
struct InvalidateParams {
    image: Option<String>,
    digest: Option<String>,
}

/// POST /admin/cache/invalidate?image=&digest=
async fn invalidate_cache(
    State(state): State<AppState>,
    Query(params): Query<InvalidateParams>,
) -> Response {
    if let Some(image) = params.image.as_deref().filter(|s| !s.is_empty()) {
        match state.cache.invalidate_repository(image).await {
            Ok(rows) => {
                tracing::info!(repository = %image, rows_affected = rows, "Invalidated tag cache");
            }
            Err(e) => {
                tracing::error!(repository = %image, error = %e, "Tag cache invalidation failed");
            }
        }
    }

    if let Some(digest) = params.digest.as_deref().filter(|s| !s.is_empty()) {
        match state.cache.invalidate_digest(digest).await {
            Ok(rows) => {
                tracing::info!(digest = %digest, rows_affected = rows, "Invalidated registry cache");
            }
            Err(e) => {
                tracing::error!(digest = %digest, error = %e, "Registry cache invalidation failed");
            }
        }
    }

    StatusCode::OK.into_response()
}

pub fn build_router(state: AppState, limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/v2/", get(api_version))
        .route("/v2/_catalog", get(catalog))
        .route("/v2/*path", get(get_v2_wrapper).head(head_v2_wrapper))
        .route("/admin/cache/invalidate", post(invalidate_cache))
        .layer(axum::middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.index.clone(),
            middleware::access_log,
        ))
        .with_state(state)
}

/// Bind and serve in a spawned task; returns the bound address and the
/// task handle. Shutdown is graceful on ctrl-c.
pub async fn start_server(
    addr: &str,
    state: AppState,
    limiter: Arc<RateLimiter>,
) -> crate::error::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let app = build_router(state, limiter);

    let handle = tokio::spawn(async move {
        tracing::info!(addr = %local_addr, "Server listening");
        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            tracing::error!(error = %e, "Server error");
        }
    });

    Ok((local_addr, handle))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");
}
