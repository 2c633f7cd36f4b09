//! Blob flow: cache hit, or the single-flight download pipeline.

use crate::cache::CacheLookup;
use crate::error::ProxyError;
use crate::server::{v2_headers, AppState};
use crate::singleflight::{BlobServed, Fetched};
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio_util::io::ReaderStream;

/// GET /v2/<image>/blobs/<digest>
pub async fn get_blob(state: &AppState, image: &str, digest: &str) -> Response {
    let cache_key = format!("blobs/{image}/{digest}");

    match state.cache.get(&cache_key).await {
        Ok(CacheLookup::Hit {
            bytes,
            digest: stored_digest,
            media_type,
        }) => {
            tracing::info!(digest = %digest, size = bytes.len(), "Serving blob from persistent cache");
            let mut headers = v2_headers();
            if let Ok(value) = media_type.parse() {
                headers.insert("Content-Type", value);
            }
            if let Ok(value) = stored_digest.parse() {
                headers.insert("Docker-Content-Digest", value);
            }
            if let Ok(value) = bytes.len().to_string().parse() {
                headers.insert("Content-Length", value);
            }
            return (StatusCode::OK, headers, bytes).into_response();
        }
        Ok(CacheLookup::Miss) | Ok(CacheLookup::Expired) => {
            tracing::debug!(digest = %digest, "Blob cache miss");
        }
        Err(e) => {
            tracing::warn!(digest = %digest, error = %e, "Blob cache lookup failed");
        }
    }

    let upstream = state.upstream.clone();
    let fetch_image = image.to_string();
    let fetch_digest = digest.to_string();

    let served = state
        .blobs
        .serve(digest, state.cache.clone(), &cache_key, state.cache_ttl, || async move {
            tracing::info!(digest = %fetch_digest, image = %fetch_image, "Downloading blob from upstream");
            let response = upstream.get_blob(&fetch_image, &fetch_digest).await?;
            if response.status().is_success() {
                Ok(Fetched::Stream(response.bytes_stream().boxed()))
            } else {
                Ok(Fetched::Refused(response))
            }
        })
        .await;

    match served {
        Ok(BlobServed::Temp { file, size }) => {
            let mut headers = v2_headers();
            headers.insert(
                "Content-Type",
                "application/octet-stream".parse().expect("static header"),
            );
            if let Ok(value) = digest.parse() {
                headers.insert("Docker-Content-Digest", value);
            }
            if let Ok(value) = size.to_string().parse() {
                headers.insert("Content-Length", value);
            }
            let body = Body::from_stream(ReaderStream::new(file));
            (StatusCode::OK, headers, body).into_response()
        }
        Ok(BlobServed::Direct(stream)) => {
            let mut headers = v2_headers();
            headers.insert(
                "Content-Type",
                "application/octet-stream".parse().expect("static header"),
            );
            if let Ok(value) = digest.parse() {
                headers.insert("Docker-Content-Digest", value);
            }
            (StatusCode::OK, headers, Body::from_stream(stream)).into_response()
        }
        Ok(BlobServed::Refused(response)) => crate::registry::forward_response(response).await,
        Err(ProxyError::DigestMismatch { expected, actual }) => {
            tracing::error!(
                expected = %expected,
                actual = %actual,
                "Blob digest mismatch"
            );
            (StatusCode::BAD_GATEWAY, "Digest mismatch").into_response()
        }
        Err(e) => {
            tracing::error!(digest = %digest, error = %e, "Blob download failed");
            (StatusCode::BAD_GATEWAY, "Blob fetch failed").into_response()
        }
    }
}

/// HEAD /v2/<image>/blobs/<digest>
///
/// Same headers as GET without the body; a miss still runs the download
/// pipeline so the follow-up GET is a hit.
pub async fn head_blob(state: &AppState, image: &str, digest: &str) -> Response {
    let cache_key = format!("blobs/{image}/{digest}");

    match state.cache.get(&cache_key).await {
        Ok(CacheLookup::Hit {
            bytes,
            digest: stored_digest,
            media_type,
        }) => {
            let mut headers = v2_headers();
            if let Ok(value) = media_type.parse() {
                headers.insert("Content-Type", value);
            }
            if let Ok(value) = stored_digest.parse() {
                headers.insert("Docker-Content-Digest", value);
            }
            if let Ok(value) = bytes.len().to_string().parse() {
                headers.insert("Content-Length", value);
            }
            return (StatusCode::OK, headers).into_response();
        }
        Ok(CacheLookup::Miss) | Ok(CacheLookup::Expired) => {
            tracing::debug!(digest = %digest, "Blob cache miss on HEAD");
        }
        Err(e) => {
            tracing::warn!(digest = %digest, error = %e, "Blob cache lookup failed");
        }
    }

    let upstream = state.upstream.clone();
    let fetch_image = image.to_string();
    let fetch_digest = digest.to_string();

    let served = state
        .blobs
        .serve(digest, state.cache.clone(), &cache_key, state.cache_ttl, || async move {
            tracing::info!(digest = %fetch_digest, image = %fetch_image, "Downloading blob from upstream");
            let response = upstream.get_blob(&fetch_image, &fetch_digest).await?;
            if response.status().is_success() {
                Ok(Fetched::Stream(response.bytes_stream().boxed()))
            } else {
                Ok(Fetched::Refused(response))
            }
        })
        .await;

    match served {
        // The temp artifact stays behind for the deferred upload; only the
        // body is dropped
        Ok(BlobServed::Temp { file: _, size }) => {
            let mut headers = v2_headers();
            headers.insert(
                "Content-Type",
                "application/octet-stream".parse().expect("static header"),
            );
            if let Ok(value) = digest.parse() {
                headers.insert("Docker-Content-Digest", value);
            }
            if let Ok(value) = size.to_string().parse() {
                headers.insert("Content-Length", value);
            }
            (StatusCode::OK, headers).into_response()
        }
        Ok(BlobServed::Direct(stream)) => {
            // Degraded cross-process path: nothing verified to measure
            drop(stream);
            let mut headers = v2_headers();
            headers.insert(
                "Content-Type",
                "application/octet-stream".parse().expect("static header"),
            );
            if let Ok(value) = digest.parse() {
                headers.insert("Docker-Content-Digest", value);
            }
            (StatusCode::OK, headers).into_response()
        }
        Ok(BlobServed::Refused(response)) => {
            crate::registry::forward_response_headers(&response)
        }
        Err(ProxyError::DigestMismatch { expected, actual }) => {
            tracing::error!(
                expected = %expected,
                actual = %actual,
                "Blob digest mismatch"
            );
            (StatusCode::BAD_GATEWAY, "Digest mismatch").into_response()
        }
        Err(e) => {
            tracing::error!(digest = %digest, error = %e, "Blob download failed");
            (StatusCode::BAD_GATEWAY, "Blob fetch failed").into_response()
        }
    }
}
