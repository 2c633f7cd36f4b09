//! In-memory metadata index used by tests.

use super::metadata::{AccessLogRow, CacheEntryRow, MetadataIndex, TagEntryRow};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use time::OffsetDateTime;

#[derive(Default)]
pub struct MemoryIndex {
    cache_entries: Mutex<HashMap<String, CacheEntryRow>>,
    tag_entries: Mutex<HashMap<String, TagEntryRow>>,
    access_logs: Mutex<Vec<AccessLogRow>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_entry(&self, key: &str) -> Option<CacheEntryRow> {
        self.cache_entries.lock().unwrap().get(key).cloned()
    }

    pub fn tag_entry(&self, repository: &str) -> Option<TagEntryRow> {
        self.tag_entries.lock().unwrap().get(repository).cloned()
    }

    pub fn cache_entry_count(&self) -> usize {
        self.cache_entries.lock().unwrap().len()
    }

    pub fn access_log_count(&self) -> usize {
        self.access_logs.lock().unwrap().len()
    }
}

#[async_trait]
impl MetadataIndex for MemoryIndex {
    async fn find_cache_entry(&self, key: &str) -> Result<Option<CacheEntryRow>> {
        Ok(self.cache_entries.lock().unwrap().get(key).cloned())
    }

    async fn upsert_cache_entry(&self, entry: &CacheEntryRow) -> Result<()> {
        let mut entries = self.cache_entries.lock().unwrap();
        match entries.get_mut(&entry.key) {
            Some(existing) => {
                // stored_at keeps the first-insert time, matching the
                // Postgres conflict update-set
                existing.digest = entry.digest.clone();
                existing.media_type = entry.media_type.clone();
                existing.expires_at = entry.expires_at;
                existing.last_access = entry.last_access;
                existing.size_bytes = entry.size_bytes;
            }
            None => {
                entries.insert(entry.key.clone(), entry.clone());
            }
        }
        Ok(())
    }

    async fn touch_last_access(&self, key: &str, now: OffsetDateTime) -> Result<()> {
        if let Some(entry) = self.cache_entries.lock().unwrap().get_mut(key) {
            entry.last_access = now;
        }
        Ok(())
    }

    async fn delete_cache_entry(&self, key: &str) -> Result<()> {
        self.cache_entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn delete_cache_entries_by_digest(&self, digest: &str) -> Result<u64> {
        let mut entries = self.cache_entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.digest != digest);
        Ok((before - entries.len()) as u64)
    }

    async fn find_tag_entry(&self, repository: &str) -> Result<Option<TagEntryRow>> {
        Ok(self.tag_entries.lock().unwrap().get(repository).cloned())
    }

    async fn upsert_tag_entry(&self, entry: &TagEntryRow) -> Result<()> {
        self.tag_entries
            .lock()
            .unwrap()
            .insert(entry.repository.clone(), entry.clone());
        Ok(())
    }

    async fn refresh_tag_entry(
        &self,
        repository: &str,
        stored_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Result<()> {
        if let Some(entry) = self.tag_entries.lock().unwrap().get_mut(repository) {
            entry.stored_at = stored_at;
            entry.expires_at = expires_at;
        }
        Ok(())
    }

    async fn delete_tag_entry(&self, repository: &str) -> Result<u64> {
        let removed = self.tag_entries.lock().unwrap().remove(repository);
        Ok(removed.is_some() as u64)
    }

    async fn expired_cache_entries(
        &self,
        now: OffsetDateTime,
        idle_cutoff: OffsetDateTime,
    ) -> Result<Vec<CacheEntryRow>> {
        Ok(self
            .cache_entries
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.expires_at < now || entry.last_access < idle_cutoff)
            .cloned()
            .collect())
    }

    async fn expired_tag_entries(&self, now: OffsetDateTime) -> Result<Vec<TagEntryRow>> {
        Ok(self
            .tag_entries
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.expires_at < now)
            .cloned()
            .collect())
    }

    async fn insert_access_log(&self, entry: &AccessLogRow) -> Result<()> {
        self.access_logs.lock().unwrap().push(entry.clone());
        Ok(())
    }
}
