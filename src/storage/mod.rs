//! Object store abstraction for cached byte content.
//!
//! Objects are keyed like `manifests/<image>/<reference>` and
//! `blobs/<image>/<digest>` and carry the content digest as user metadata
//! so a cache hit can be answered without consulting the metadata row.

mod memory;
mod s3;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;

/// User-metadata key carrying the content digest on stored objects.
pub const DIGEST_METADATA_KEY: &str = "docker-content-digest";

/// Object store failure classes, driving the retry policy of callers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,

    #[error("throttled by object store: {0}")]
    Throttled(String),

    #[error("transient object store error: {0}")]
    Transient(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("object store error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Throttled(_) | StoreError::Transient(_))
    }
}

/// An object fetched from the store.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub content_type: String,
    /// Content digest recorded in user metadata, when present.
    pub digest: Option<String>,
}

/// Bucket-scoped object operations.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<StoredObject, StoreError>;

    /// Idempotent overwrite of a whole object.
    async fn put_bytes(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        digest: &str,
    ) -> Result<(), StoreError>;

    /// Streaming upload for content of unknown or large size.
    async fn put_stream(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
        digest: &str,
    ) -> Result<(), StoreError>;

    /// Idempotent delete; a missing object is success.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
