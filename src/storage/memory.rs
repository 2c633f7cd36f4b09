//! In-memory object store used by tests and local experiments.

use super::{ObjectStore, StoreError, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
    fail_puts: RwLock<bool>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent puts fail with a transient error.
    pub fn set_fail_puts(&self, fail: bool) {
        *self.fail_puts.write().unwrap() = fail;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().unwrap().is_empty()
    }

    /// Drop an object behind the index's back, for inconsistency tests.
    pub fn remove(&self, key: &str) {
        self.objects.write().unwrap().remove(key);
    }

    fn insert(&self, key: &str, bytes: Bytes, content_type: &str, digest: &str) {
        self.objects.write().unwrap().insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
                digest: Some(digest.to_string()),
            },
        );
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        self.objects
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn put_bytes(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        digest: &str,
    ) -> Result<(), StoreError> {
        if *self.fail_puts.read().unwrap() {
            return Err(StoreError::Transient("puts disabled".to_string()));
        }
        self.insert(key, bytes, content_type, digest);
        Ok(())
    }

    async fn put_stream(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
        digest: &str,
    ) -> Result<(), StoreError> {
        if *self.fail_puts.read().unwrap() {
            return Err(StoreError::Transient("puts disabled".to_string()));
        }
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| StoreError::Transient(format!("read upload stream: {e}")))?;
        self.insert(key, Bytes::from(bytes), content_type, digest);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects.write().unwrap().remove(key);
        Ok(())
    }
}
