//! Two-tier cache: object store for bytes, metadata index for everything
//! else. All CacheEntry/TagEntry writes go through this facade.

pub mod memory;
pub mod metadata;
pub mod postgres;

pub use memory::MemoryIndex;
pub use metadata::{AccessLogRow, CacheEntryRow, MetadataIndex, TagEntryRow};
pub use postgres::PostgresIndex;

use crate::error::{ProxyError, Result};
use crate::storage::{ObjectStore, StoreError};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::AsyncRead;

/// Outcome of a cache lookup.
pub enum CacheLookup {
    Hit {
        bytes: Bytes,
        digest: String,
        media_type: String,
    },
    Miss,
    Expired,
}

/// Expected shape of an upstream tag-list payload.
#[derive(Deserialize)]
struct TagListPayload {
    #[allow(dead_code)]
    name: String,
    #[allow(dead_code)]
    tags: Vec<String>,
}

pub struct Cache {
    store: Arc<dyn ObjectStore>,
    index: Arc<dyn MetadataIndex>,
}

impl Cache {
    pub fn new(store: Arc<dyn ObjectStore>, index: Arc<dyn MetadataIndex>) -> Self {
        Self { store, index }
    }

    /// Look up a cached object, evicting lazily on expiry.
    pub async fn get(&self, key: &str) -> Result<CacheLookup> {
        let entry = match self.index.find_cache_entry(key).await? {
            Some(entry) => entry,
            None => return Ok(CacheLookup::Miss),
        };

        let now = OffsetDateTime::now_utc();
        if now >= entry.expires_at {
            tracing::debug!(key = %key, "Cache entry expired, evicting");
            if let Err(e) = self.delete(key).await {
                tracing::warn!(key = %key, error = %e, "Failed to delete expired entry");
            }
            return Ok(CacheLookup::Expired);
        }

        let object = match self.store.get(key).await {
            Ok(object) => object,
            Err(StoreError::NotFound) => {
                // Row without object: recoverable inconsistency
                tracing::warn!(key = %key, "Cache row present but object missing, treating as miss");
                if let Err(e) = self.index.delete_cache_entry(key).await {
                    tracing::warn!(key = %key, error = %e, "Failed to delete inconsistent entry");
                }
                return Ok(CacheLookup::Miss);
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.index.touch_last_access(key, now).await {
            tracing::warn!(key = %key, error = %e, "Failed to update last access time");
        }

        Ok(CacheLookup::Hit {
            bytes: object.bytes,
            digest: object.digest.unwrap_or(entry.digest),
            media_type: if object.content_type.is_empty() {
                entry.media_type
            } else {
                object.content_type
            },
        })
    }

    /// Store a whole object, then its metadata row. Upload failure writes
    /// no row.
    pub async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        digest: &str,
        media_type: &str,
        ttl: Duration,
    ) -> Result<()> {
        let size = bytes.len() as i64;
        self.store
            .put_bytes(key, bytes, media_type, digest)
            .await?;
        self.upsert_entry(key, digest, media_type, ttl, size).await
    }

    /// Store from a reader; the row records an unmeasured size.
    pub async fn put_stream(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        digest: &str,
        media_type: &str,
        ttl: Duration,
    ) -> Result<()> {
        self.store
            .put_stream(key, reader, media_type, digest)
            .await?;
        self.upsert_entry(key, digest, media_type, ttl, -1).await
    }

    /// Delete the object, then the row. Both are idempotent.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(key).await?;
        self.index.delete_cache_entry(key).await
    }

    async fn upsert_entry(
        &self,
        key: &str,
        digest: &str,
        media_type: &str,
        ttl: Duration,
        size_bytes: i64,
    ) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        self.index
            .upsert_cache_entry(&CacheEntryRow {
                key: key.to_string(),
                digest: digest.to_string(),
                media_type: media_type.to_string(),
                stored_at: now,
                expires_at: now + ttl,
                last_access: now,
                size_bytes,
            })
            .await
    }

    pub async fn find_tags(&self, repository: &str) -> Result<Option<TagEntryRow>> {
        self.index.find_tag_entry(repository).await
    }

    /// Store a tag-list payload. Malformed payloads are never written.
    pub async fn store_tags(
        &self,
        repository: &str,
        body: &[u8],
        etag: &str,
        last_modified: Option<OffsetDateTime>,
        ttl: Duration,
    ) -> Result<()> {
        if serde_json::from_slice::<TagListPayload>(body).is_err() {
            return Err(ProxyError::Cache(format!(
                "malformed tag list payload for {repository}"
            )));
        }

        let now = OffsetDateTime::now_utc();
        self.index
            .upsert_tag_entry(&TagEntryRow {
                repository: repository.to_string(),
                tags: String::from_utf8_lossy(body).into_owned(),
                etag: etag.to_string(),
                last_modified,
                stored_at: now,
                expires_at: now + ttl,
            })
            .await
    }

    /// Revalidation succeeded upstream: advance freshness, keep the bytes.
    pub async fn refresh_tags(&self, repository: &str, ttl: Duration) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        self.index
            .refresh_tag_entry(repository, now, now + ttl)
            .await
    }

    pub async fn invalidate_repository(&self, repository: &str) -> Result<u64> {
        self.index.delete_tag_entry(repository).await
    }

    pub async fn invalidate_digest(&self, digest: &str) -> Result<u64> {
        self.index.delete_cache_entries_by_digest(digest).await
    }
}
