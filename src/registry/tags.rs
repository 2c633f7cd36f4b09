//! Tag-list flow with ETag revalidation.

use crate::cache::TagEntryRow;
use crate::error::ProxyError;
use crate::server::{v2_headers, AppState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;

/// GET /v2/<image>/tags/list
pub async fn get_tags(state: &AppState, image: &str) -> Response {
    let now = OffsetDateTime::now_utc();
    let ttl = state.tag_cache_ttl;

    let cached = match state.cache.find_tags(image).await {
        Ok(cached) => cached,
        Err(e) => {
            tracing::warn!(repository = %image, error = %e, "Tag cache lookup failed");
            None
        }
    };

    if let Some(entry) = cached {
        if now < entry.expires_at {
            // Fresh within the first half of the TTL: no upstream contact
            if now < entry.stored_at + ttl / 2 {
                tracing::info!(
                    repository = %image,
                    etag = %entry.etag,
                    "Serving fresh cached tags"
                );
                return serve_cached(&entry);
            }

            // Stale but valid: revalidate against upstream
            tracing::debug!(
                repository = %image,
                etag = %entry.etag,
                "Revalidating stale tag cache with upstream"
            );
            match state.upstream.conditional_get_tags(image, &entry.etag).await {
                Ok(crate::registry::ConditionalTags::NotModified) => {
                    if let Err(e) = state.cache.refresh_tags(image, ttl).await {
                        tracing::warn!(repository = %image, error = %e, "Failed to refresh tag entry");
                    }
                    tracing::info!(repository = %image, "Tag cache revalidated, serving cached tags");
                    return serve_cached(&entry);
                }
                Ok(crate::registry::ConditionalTags::Response(response))
                    if response.status() == reqwest::StatusCode::OK =>
                {
                    match store_from_response(state, image, response).await {
                        Ok(served) => return served,
                        Err(e) => {
                            tracing::warn!(
                                repository = %image,
                                error = %e,
                                "Failed to store revalidated tags, serving stale"
                            );
                            return serve_cached(&entry);
                        }
                    }
                }
                Ok(crate::registry::ConditionalTags::Response(response)) => {
                    // Degraded: upstream is misbehaving, the stale copy wins
                    tracing::warn!(
                        repository = %image,
                        status = %response.status(),
                        "Tag revalidation failed, serving stale tags"
                    );
                    return serve_cached(&entry);
                }
                Err(e) => {
                    tracing::warn!(
                        repository = %image,
                        error = %e,
                        "Tag revalidation request failed, serving stale tags"
                    );
                    return serve_cached(&entry);
                }
            }
        }
    }

    // Absent or expired: full fetch
    tracing::debug!(repository = %image, "Fetching tags from upstream");
    let response = match state.upstream.get_tags(image).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(repository = %image, error = %e, "Failed to fetch tags from upstream");
            return (StatusCode::BAD_GATEWAY, "Failed to fetch tags").into_response();
        }
    };

    if response.status() != reqwest::StatusCode::OK {
        tracing::warn!(
            repository = %image,
            status = %response.status(),
            "Upstream tags response forwarded"
        );
        return crate::registry::forward_response(response).await;
    }

    match store_from_response(state, image, response).await {
        Ok(served) => served,
        Err(ProxyError::Cache(reason)) => {
            tracing::error!(repository = %image, reason = %reason, "Invalid tags payload from upstream");
            (StatusCode::BAD_GATEWAY, "Invalid tags response").into_response()
        }
        Err(e) => {
            tracing::error!(repository = %image, error = %e, "Failed to handle tags response");
            (StatusCode::BAD_GATEWAY, "Failed to fetch tags").into_response()
        }
    }
}

fn serve_cached(entry: &TagEntryRow) -> Response {
    let mut headers = v2_headers();
    headers.insert(
        "Content-Type",
        "application/json".parse().expect("static header"),
    );
    if let Ok(value) = entry.etag.parse() {
        headers.insert("ETag", value);
    }
    (StatusCode::OK, headers, entry.tags.clone()).into_response()
}

/// Read an upstream 200, validate and cache the payload, serve it.
/// A malformed payload is a `ProxyError::Cache` and is never written;
/// metadata-store trouble is logged and the fresh body served anyway.
async fn store_from_response(
    state: &AppState,
    image: &str,
    response: reqwest::Response,
) -> crate::error::Result<Response> {
    let etag = response
        .headers()
        .get("etag")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let last_modified = response
        .headers()
        .get("last-modified")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
        .map(OffsetDateTime::from);

    let body = response.bytes().await?;

    match state
        .cache
        .store_tags(image, &body, &etag, last_modified, state.tag_cache_ttl)
        .await
    {
        Ok(()) => {
            tracing::info!(repository = %image, etag = %etag, size = body.len(), "Tags cached");
        }
        Err(e @ ProxyError::Cache(_)) => return Err(e),
        Err(e) => {
            tracing::warn!(repository = %image, error = %e, "Failed to cache tags");
        }
    }

    let mut headers = v2_headers();
    headers.insert(
        "Content-Type",
        "application/json".parse().expect("static header"),
    );
    if let Ok(value) = etag.parse() {
        headers.insert("ETag", value);
    }
    Ok((StatusCode::OK, headers, body).into_response())
}
