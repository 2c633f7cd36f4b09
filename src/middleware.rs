//! Request middleware: access logging and per-IP rate limiting.

use crate::cache::{AccessLogRow, MetadataIndex};
use crate::config::ACCESS_LOG_TIMEOUT;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Fixed-window request counter per client IP.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    clients: Mutex<HashMap<String, ClientWindow>>,
}

struct ClientWindow {
    count: u32,
    window_start: Instant,
    last_seen: Instant,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            limit,
            window,
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn allow(&self, client_ip: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap();
        let entry = clients
            .entry(client_ip.to_string())
            .or_insert_with(|| ClientWindow {
                count: 0,
                window_start: now,
                last_seen: now,
            });

        entry.last_seen = now;
        if now.duration_since(entry.window_start) >= self.window {
            entry.window_start = now;
            entry.count = 0;
        }

        entry.count += 1;
        entry.count <= self.limit
    }

    /// Drop clients idle for three windows.
    pub fn sweep_idle(&self) {
        let idle_after = self.window * 3;
        let now = Instant::now();
        self.clients
            .lock()
            .unwrap()
            .retain(|_, client| now.duration_since(client.last_seen) < idle_after);
    }

    /// Periodic sweep, spawned explicitly by the supervisor.
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                limiter.sweep_idle();
            }
        })
    }
}

pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client_ip = client_ip(&request);
    if !limiter.allow(&client_ip) {
        tracing::warn!(client_ip = %client_ip, "Rate limit exceeded");
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response();
    }
    next.run(request).await
}

pub async fn access_log(
    State(index): State<Arc<dyn MetadataIndex>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let timestamp = OffsetDateTime::now_utc();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let client_ip = client_ip(&request);
    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let response = next.run(request).await;

    let status = response.status().as_u16() as i32;
    let duration = start.elapsed();
    // Streamed bodies have no measured length; Content-Length is the best
    // available figure
    let bytes_sent = response
        .headers()
        .get("content-length")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0);

    tracing::info!(
        method = %method,
        path = %path,
        status = status,
        duration_ms = duration.as_millis() as u64,
        client_ip = %client_ip,
        bytes = bytes_sent,
        "Request processed"
    );

    // The insert runs off the hot path under its own short deadline
    tokio::spawn(async move {
        let entry = AccessLogRow {
            timestamp,
            method,
            path,
            status,
            duration_ms: duration.as_millis() as i64,
            client_ip,
            user_agent,
            bytes_sent,
        };
        match tokio::time::timeout(ACCESS_LOG_TIMEOUT, index.insert_access_log(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to save access log");
            }
            Err(_) => {
                tracing::warn!("Access log write timed out");
            }
        }
    });

    response
}

/// Client IP: X-Forwarded-For first, then X-Real-IP, then the peer address.
fn client_ip(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
    {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
