//! Registry v2 request flows and the upstream client.

pub mod blob;
pub mod manifest;
pub mod tags;
pub mod upstream;

pub use upstream::{ConditionalTags, UpstreamClient};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

fn forwarded_parts(response: &reqwest::Response) -> (StatusCode, axum::http::HeaderMap) {
    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut headers = axum::http::HeaderMap::new();
    for (name, value) in response.headers() {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(name, value);
        }
    }

    (status, headers)
}

/// Forward an upstream response transparently: status, headers, body.
pub async fn forward_response(response: reqwest::Response) -> Response {
    let (status, headers) = forwarded_parts(&response);
    let body = response.bytes().await.unwrap_or_default();
    (status, headers, body).into_response()
}

/// Forward status and headers only, for HEAD flows. Dropping the response
/// abandons the body transfer.
pub fn forward_response_headers(response: &reqwest::Response) -> Response {
    let (status, headers) = forwarded_parts(response);
    (status, headers).into_response()
}
