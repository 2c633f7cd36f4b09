//! Upstream Registry v2 client with Bearer-token authentication.

use crate::config::{
    DEFAULT_MANIFEST_ACCEPT_HEADER, DEFAULT_REGISTRY_URL, TOKEN_EXPIRY_SAFETY_MARGIN_SECS,
    UPSTREAM_TIMEOUT_SECS, USER_AGENT,
};
use crate::error::{ProxyError, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Token endpoints that omit expires_in get this lifetime.
const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 300;

/// Result of a conditional tag-list fetch.
pub enum ConditionalTags {
    NotModified,
    Response(Response),
}

#[derive(Clone)]
struct BearerToken {
    token: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    expires_in: Option<u64>,
}

pub struct UpstreamClient {
    client: Client,
    base_url: String,
    credentials: Option<(String, String)>,
    /// Process-wide token state: readers snapshot, refreshers swap whole.
    token: RwLock<Option<BearerToken>>,
}

impl UpstreamClient {
    pub fn new(credentials: Option<(String, String)>) -> Result<Self> {
        Self::with_base_url(DEFAULT_REGISTRY_URL, credentials)
    }

    pub fn with_base_url(base_url: &str, credentials: Option<(String, String)>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET /v2/<image>/manifests/<reference>
    pub async fn get_manifest(
        &self,
        image: &str,
        reference: &str,
        accept: Option<&str>,
    ) -> Result<Response> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url,
            normalize_image(image),
            reference
        );
        let request = self
            .client
            .get(&url)
            .header("Accept", accept.unwrap_or(DEFAULT_MANIFEST_ACCEPT_HEADER));
        self.do_request_with_auth(request).await
    }

    /// GET /v2/<image>/blobs/<digest>
    pub async fn get_blob(&self, image: &str, digest: &str) -> Result<Response> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url,
            normalize_image(image),
            digest
        );
        self.do_request_with_auth(self.client.get(&url)).await
    }

    /// GET /v2/<image>/tags/list
    pub async fn get_tags(&self, image: &str) -> Result<Response> {
        let url = format!(
            "{}/v2/{}/tags/list",
            self.base_url,
            normalize_image(image)
        );
        self.do_request_with_auth(self.client.get(&url)).await
    }

    /// Conditional tag-list fetch; `304 Not Modified` is a distinguished
    /// outcome rather than an error.
    pub async fn conditional_get_tags(&self, image: &str, etag: &str) -> Result<ConditionalTags> {
        let url = format!(
            "{}/v2/{}/tags/list",
            self.base_url,
            normalize_image(image)
        );
        let request = self.client.get(&url).header("If-None-Match", etag);
        let response = self.do_request_with_auth(request).await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            Ok(ConditionalTags::NotModified)
        } else {
            Ok(ConditionalTags::Response(response))
        }
    }

    /// Issue a request, handling the Registry v2 token dance: attach the
    /// cached Bearer token when valid, and on a 401 challenge fetch a fresh
    /// token and reissue the request exactly once. A second 401, or a 401
    /// without a Bearer challenge, is returned to the caller untouched.
    pub async fn do_request_with_auth(&self, request: RequestBuilder) -> Result<Response> {
        let retry = request
            .try_clone()
            .ok_or_else(|| ProxyError::UpstreamAuth("unclonable upstream request".to_string()))?;

        let mut first = request;
        if let Some(token) = self.current_token().await {
            first = first.bearer_auth(token);
        }

        let response = first.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get("www-authenticate")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_bearer_challenge);

        let challenge = match challenge {
            Some(challenge) => challenge,
            // Not a Bearer challenge we can answer
            None => return Ok(response),
        };

        let token = self.fetch_token(&challenge).await?;
        Ok(retry.bearer_auth(token).send().await?)
    }

    async fn current_token(&self) -> Option<String> {
        let guard = self.token.read().await;
        let cached = guard.as_ref()?;
        let margin = Duration::from_secs(TOKEN_EXPIRY_SAFETY_MARGIN_SECS);
        if Instant::now() + margin >= cached.expires_at {
            return None;
        }
        Some(cached.token.clone())
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String> {
        let mut request = self.client.get(&challenge.realm);

        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope));
        }
        request = request.query(&query);

        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        let start = Instant::now();
        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            return Err(ProxyError::UpstreamAuth(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let token_response: TokenResponse = response.json().await?;
        let expires_in = token_response
            .expires_in
            .unwrap_or(DEFAULT_TOKEN_EXPIRY_SECS);

        tracing::debug!(
            realm = %challenge.realm,
            scope = ?challenge.scope,
            expires_in = expires_in,
            duration_ms = start.elapsed().as_millis() as u64,
            "Acquired upstream bearer token"
        );

        let mut guard = self.token.write().await;
        *guard = Some(BearerToken {
            token: token_response.token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });

        Ok(token_response.token)
    }
}

/// Prepend `library/` to bare Docker Hub image names.
pub fn normalize_image(image: &str) -> String {
    if image.contains('/') {
        image.to_string()
    } else {
        format!("library/{image}")
    }
}

/// Parse `Bearer realm="…",service="…",scope="…"`. Returns None for
/// non-Bearer schemes or a missing realm.
fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.strip_prefix("Bearer ")?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    for part in params.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim_matches('"').to_string();
            match key {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}
