//! Purger reconciliation tests.

use bytes::Bytes;
use registry_proxy::cache::{CacheEntryRow, MemoryIndex, MetadataIndex, TagEntryRow};
use registry_proxy::purge::Purger;
use registry_proxy::storage::{MemoryObjectStore, ObjectStore};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

async fn seed_entry(
    store: &MemoryObjectStore,
    index: &MemoryIndex,
    key: &str,
    expires_at: OffsetDateTime,
    last_access: OffsetDateTime,
) {
    store
        .put_bytes(key, Bytes::from_static(b"content"), "application/octet-stream", "sha256:aa")
        .await
        .unwrap();
    index
        .upsert_cache_entry(&CacheEntryRow {
            key: key.to_string(),
            digest: "sha256:aa".to_string(),
            media_type: "application/octet-stream".to_string(),
            stored_at: expires_at - Duration::from_secs(3600),
            expires_at,
            last_access,
            size_bytes: 7,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_expired_entries_are_purged_from_both_tiers() {
    let store = Arc::new(MemoryObjectStore::new());
    let index = Arc::new(MemoryIndex::new());
    let now = OffsetDateTime::now_utc();

    seed_entry(
        &store,
        &index,
        "blobs/library/alpine/sha256:aa",
        now - Duration::from_secs(3600),
        now,
    )
    .await;
    seed_entry(
        &store,
        &index,
        "blobs/library/nginx/sha256:aa",
        now + Duration::from_secs(3600),
        now,
    )
    .await;

    let purger = Purger::new(store.clone(), index.clone());
    let summary = purger.run_cycle().await;

    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.failed, 0);

    // Expired entry gone from both tiers, live entry untouched
    assert!(!store.contains("blobs/library/alpine/sha256:aa"));
    assert!(index.cache_entry("blobs/library/alpine/sha256:aa").is_none());
    assert!(store.contains("blobs/library/nginx/sha256:aa"));
    assert!(index.cache_entry("blobs/library/nginx/sha256:aa").is_some());
}

#[tokio::test]
async fn test_idle_entries_are_purged_despite_valid_ttl() {
    let store = Arc::new(MemoryObjectStore::new());
    let index = Arc::new(MemoryIndex::new());
    let now = OffsetDateTime::now_utc();

    // Valid TTL but untouched for eight days
    seed_entry(
        &store,
        &index,
        "blobs/library/old/sha256:aa",
        now + Duration::from_secs(3600),
        now - Duration::from_secs(8 * 24 * 3600),
    )
    .await;

    let purger = Purger::new(store.clone(), index.clone());
    let summary = purger.run_cycle().await;

    assert_eq!(summary.deleted, 1);
    assert!(index.cache_entry("blobs/library/old/sha256:aa").is_none());
}

#[tokio::test]
async fn test_expired_tag_entries_are_purged() {
    let store = Arc::new(MemoryObjectStore::new());
    let index = Arc::new(MemoryIndex::new());
    let now = OffsetDateTime::now_utc();

    index
        .upsert_tag_entry(&TagEntryRow {
            repository: "library/alpine".to_string(),
            tags: "{\"name\":\"library/alpine\",\"tags\":[]}".to_string(),
            etag: "\"v1\"".to_string(),
            last_modified: None,
            stored_at: now - Duration::from_secs(7200),
            expires_at: now - Duration::from_secs(3600),
        })
        .await
        .unwrap();
    index
        .upsert_tag_entry(&TagEntryRow {
            repository: "library/nginx".to_string(),
            tags: "{\"name\":\"library/nginx\",\"tags\":[]}".to_string(),
            etag: "\"v2\"".to_string(),
            last_modified: None,
            stored_at: now,
            expires_at: now + Duration::from_secs(3600),
        })
        .await
        .unwrap();

    let purger = Purger::new(store, index.clone());
    let summary = purger.run_cycle().await;

    assert_eq!(summary.deleted, 1);
    assert!(index.tag_entry("library/alpine").is_none());
    assert!(index.tag_entry("library/nginx").is_some());
}

#[tokio::test]
async fn test_empty_cycle_reports_nothing() {
    let store = Arc::new(MemoryObjectStore::new());
    let index = Arc::new(MemoryIndex::new());

    let purger = Purger::new(store, index);
    let summary = purger.run_cycle().await;

    assert_eq!(summary.scanned, 0);
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.failed, 0);
}
