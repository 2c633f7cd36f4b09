//! Manifest flow: cache hit, or read-through fetch with digest derivation.

use crate::cache::CacheLookup;
use crate::config::DEFAULT_MANIFEST_ACCEPT_HEADER;
use crate::server::{v2_headers, AppState};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};

/// GET /v2/<image>/manifests/<reference>
pub async fn get_manifest(
    state: &AppState,
    image: &str,
    reference: &str,
    headers: &HeaderMap,
) -> Response {
    match fetch_manifest(state, image, reference, headers).await {
        ManifestOutcome::Cached(manifest) | ManifestOutcome::Fetched(manifest) => {
            let mut response_headers = v2_headers();
            if let Ok(value) = manifest.media_type.parse() {
                response_headers.insert("Content-Type", value);
            }
            if let Ok(value) = manifest.digest.parse() {
                response_headers.insert("Docker-Content-Digest", value);
            }
            if let Ok(value) = manifest.body.len().to_string().parse() {
                response_headers.insert("Content-Length", value);
            }
            (StatusCode::OK, response_headers, manifest.body).into_response()
        }
        ManifestOutcome::Forward(response) => crate::registry::forward_response(response).await,
        ManifestOutcome::Failed(response) => response,
    }
}

/// HEAD /v2/<image>/manifests/<reference>
///
/// Same as GET but without the body; a miss still populates the cache so
/// the follow-up GET is a hit.
pub async fn head_manifest(
    state: &AppState,
    image: &str,
    reference: &str,
    headers: &HeaderMap,
) -> Response {
    match fetch_manifest(state, image, reference, headers).await {
        ManifestOutcome::Cached(manifest) | ManifestOutcome::Fetched(manifest) => {
            let mut response_headers = v2_headers();
            if let Ok(value) = manifest.media_type.parse() {
                response_headers.insert("Content-Type", value);
            }
            if let Ok(value) = manifest.digest.parse() {
                response_headers.insert("Docker-Content-Digest", value);
            }
            if let Ok(value) = manifest.body.len().to_string().parse() {
                response_headers.insert("Content-Length", value);
            }
            (StatusCode::OK, response_headers).into_response()
        }
        ManifestOutcome::Forward(response) => {
            crate::registry::forward_response_headers(&response)
        }
        ManifestOutcome::Failed(response) => response,
    }
}

struct Manifest {
    body: bytes::Bytes,
    digest: String,
    media_type: String,
}

enum ManifestOutcome {
    Cached(Manifest),
    Fetched(Manifest),
    /// Upstream non-200, forwarded transparently.
    Forward(reqwest::Response),
    Failed(Response),
}

async fn fetch_manifest(
    state: &AppState,
    image: &str,
    reference: &str,
    headers: &HeaderMap,
) -> ManifestOutcome {
    let cache_key = format!("manifests/{image}/{reference}");

    match state.cache.get(&cache_key).await {
        Ok(CacheLookup::Hit {
            bytes,
            digest,
            media_type,
        }) => {
            tracing::info!(
                image = %image,
                reference = %reference,
                digest = %digest,
                size = bytes.len(),
                "Serving manifest from cache"
            );
            return ManifestOutcome::Cached(Manifest {
                body: bytes,
                digest,
                media_type,
            });
        }
        Ok(CacheLookup::Miss) | Ok(CacheLookup::Expired) => {
            tracing::debug!(image = %image, reference = %reference, "Manifest cache miss");
        }
        Err(e) => {
            // Cache trouble degrades to an upstream fetch, never a failure
            tracing::warn!(
                image = %image,
                reference = %reference,
                error = %e,
                "Manifest cache lookup failed"
            );
        }
    }

    let accept = headers.get("accept").and_then(|value| value.to_str().ok());

    let response = match state.upstream.get_manifest(image, reference, accept).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(image = %image, reference = %reference, error = %e, "Manifest fetch failed");
            return ManifestOutcome::Failed(
                (StatusCode::BAD_GATEWAY, "Failed to fetch manifest").into_response(),
            );
        }
    };

    if response.status() != reqwest::StatusCode::OK {
        tracing::warn!(
            image = %image,
            reference = %reference,
            status = %response.status(),
            "Upstream manifest response forwarded"
        );
        return ManifestOutcome::Forward(response);
    }

    let media_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or(DEFAULT_MANIFEST_ACCEPT_HEADER)
        .to_string();
    let upstream_digest = response
        .headers()
        .get("docker-content-digest")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(image = %image, reference = %reference, error = %e, "Manifest body read failed");
            return ManifestOutcome::Failed(
                (StatusCode::BAD_GATEWAY, "Failed to read manifest").into_response(),
            );
        }
    };

    let digest =
        upstream_digest.unwrap_or_else(|| format!("sha256:{:x}", Sha256::digest(&body)));

    if let Err(e) = state
        .cache
        .put(&cache_key, body.clone(), &digest, &media_type, state.cache_ttl)
        .await
    {
        tracing::warn!(key = %cache_key, error = %e, "Failed to cache manifest");
    }

    tracing::info!(
        image = %image,
        reference = %reference,
        digest = %digest,
        size = body.len(),
        "Manifest fetched from upstream and cached"
    );

    ManifestOutcome::Fetched(Manifest {
        body,
        digest,
        media_type,
    })
}
