//! Error types shared across the proxy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upstream auth failed: {0}")]
    UpstreamAuth(String),

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(#[from] reqwest::Error),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Object store error: {0}")]
    Store(#[from] crate::storage::StoreError),

    #[error("Metadata store error: {0}")]
    Metadata(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
