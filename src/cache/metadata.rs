//! Metadata index: relational view of what the object store holds.

use crate::error::Result;
use async_trait::async_trait;
use time::OffsetDateTime;

/// One row per cached byte object, keyed like the object store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CacheEntryRow {
    pub key: String,
    pub digest: String,
    pub media_type: String,
    pub stored_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub last_access: OffsetDateTime,
    pub size_bytes: i64,
}

/// One row per repository for the tag-list cache.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TagEntryRow {
    pub repository: String,
    pub tags: String,
    pub etag: String,
    pub last_modified: Option<OffsetDateTime>,
    pub stored_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

/// Structured per-request record, written off the hot path.
#[derive(Debug, Clone)]
pub struct AccessLogRow {
    pub timestamp: OffsetDateTime,
    pub method: String,
    pub path: String,
    pub status: i32,
    pub duration_ms: i64,
    pub client_ip: String,
    pub user_agent: String,
    pub bytes_sent: i64,
}

#[async_trait]
pub trait MetadataIndex: Send + Sync {
    async fn find_cache_entry(&self, key: &str) -> Result<Option<CacheEntryRow>>;

    /// Atomic on the primary key. The conflict update-set is digest,
    /// media_type, expires_at, last_access, size_bytes; stored_at keeps
    /// the first-insert time.
    async fn upsert_cache_entry(&self, entry: &CacheEntryRow) -> Result<()>;

    async fn touch_last_access(&self, key: &str, now: OffsetDateTime) -> Result<()>;

    async fn delete_cache_entry(&self, key: &str) -> Result<()>;

    async fn delete_cache_entries_by_digest(&self, digest: &str) -> Result<u64>;

    async fn find_tag_entry(&self, repository: &str) -> Result<Option<TagEntryRow>>;

    async fn upsert_tag_entry(&self, entry: &TagEntryRow) -> Result<()>;

    /// Conditional-revalidation refresh: advance stored_at/expires_at,
    /// leaving the tags payload untouched.
    async fn refresh_tag_entry(
        &self,
        repository: &str,
        stored_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Result<()>;

    async fn delete_tag_entry(&self, repository: &str) -> Result<u64>;

    /// Cache entries past their TTL or idle since `idle_cutoff`.
    async fn expired_cache_entries(
        &self,
        now: OffsetDateTime,
        idle_cutoff: OffsetDateTime,
    ) -> Result<Vec<CacheEntryRow>>;

    async fn expired_tag_entries(&self, now: OffsetDateTime) -> Result<Vec<TagEntryRow>>;

    async fn insert_access_log(&self, entry: &AccessLogRow) -> Result<()>;
}
