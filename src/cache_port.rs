//! The Cache Port (C4): a thin abstraction over an external content-addressed
//! object store. `InMemoryCachePort` is the default, non-durable
//! implementation used for self-hosted builds and tests; production
//! deployments supply their own `CachePort` implementation over the real
//! store.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub source_url: String,
    pub origin_host: String,
    pub cached_at: u64,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CachedObject {
    pub body: Bytes,
    pub size: u64,
    pub content_type: String,
    pub etag: String,
    pub uploaded: u64,
    pub metadata: ObjectMetadata,
}

#[derive(Debug, Clone)]
pub struct CachedMeta {
    pub size: u64,
    pub content_type: String,
    pub etag: String,
    pub uploaded: u64,
    pub metadata: ObjectMetadata,
}

impl From<&CachedObject> for CachedMeta {
    fn from(obj: &CachedObject) -> Self {
        Self {
            size: obj.size,
            content_type: obj.content_type.clone(),
            etag: obj.etag.clone(),
            uploaded: obj.uploaded,
            metadata: obj.metadata.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CachePortError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// All operations may fail; the pipeline treats read failures as misses and
/// write/delete failures as logged-and-swallowed (§7, InfraError).
#[async_trait]
pub trait CachePort: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedObject>, CachePortError>;
    async fn head(&self, key: &str) -> Result<Option<CachedMeta>, CachePortError>;
    async fn get_range(
        &self,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Option<CachedObject>, CachePortError>;
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: String,
        metadata: ObjectMetadata,
    ) -> Result<(), CachePortError>;
    async fn delete(&self, key: &str) -> Result<(), CachePortError>;
}

pub fn generate_etag(body: &[u8]) -> String {
    let hash = xxh3_64(body);
    format!("\"{}\"", base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hash.to_be_bytes()))
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Sharded in-memory default. Shard count follows the teacher's
/// `(num_cpus * 4).next_power_of_two()` heuristic for concurrent map sizing.
pub struct InMemoryCachePort {
    objects: DashMap<String, CachedObject>,
    // DashMap is already internally sharded; this lock only protects the
    // rare cross-key invariant checks (none currently needed, kept for
    // parity with the shard-count-driven construction idiom).
    _shard_hint: RwLock<usize>,
}

impl InMemoryCachePort {
    pub fn new() -> Self {
        let shard_hint = (num_cpus::get() * 4).next_power_of_two();
        Self {
            objects: DashMap::with_shard_amount(shard_hint),
            _shard_hint: RwLock::new(shard_hint),
        }
    }
}

impl Default for InMemoryCachePort {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CachePort for InMemoryCachePort {
    async fn get(&self, key: &str) -> Result<Option<CachedObject>, CachePortError> {
        Ok(self.objects.get(key).map(|entry| entry.value().clone()))
    }

    async fn head(&self, key: &str) -> Result<Option<CachedMeta>, CachePortError> {
        Ok(self.objects.get(key).map(|entry| CachedMeta::from(entry.value())))
    }

    async fn get_range(
        &self,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Option<CachedObject>, CachePortError> {
        let Some(entry) = self.objects.get(key) else {
            return Ok(None);
        };
        let obj = entry.value();
        let start = offset as usize;
        let end = ((offset + length) as usize).min(obj.body.len());
        if start >= obj.body.len() || start > end {
            return Ok(None);
        }
        let mut sliced = obj.clone();
        sliced.body = obj.body.slice(start..end);
        sliced.size = sliced.body.len() as u64;
        Ok(Some(sliced))
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: String,
        metadata: ObjectMetadata,
    ) -> Result<(), CachePortError> {
        let etag = generate_etag(&body);
        let size = body.len() as u64;
        self.objects.insert(
            key.to_string(),
            CachedObject {
                body,
                size,
                content_type,
                etag,
                uploaded: now_unix(),
                metadata,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CachePortError> {
        self.objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ObjectMetadata {
        ObjectMetadata {
            source_url: "https://example.com/a.jpg".into(),
            origin_host: "example.com".into(),
            cached_at: 0,
            content_length: Some(5),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryCachePort::new();
        store
            .put("example.com/a.jpg", Bytes::from_static(b"hello"), "image/jpeg".into(), meta())
            .await
            .unwrap();

        let obj = store.get("example.com/a.jpg").await.unwrap().unwrap();
        assert_eq!(obj.body, Bytes::from_static(b"hello"));
        assert_eq!(obj.size, 5);
        assert!(!obj.etag.is_empty());
    }

    #[tokio::test]
    async fn head_returns_metadata_without_body() {
        let store = InMemoryCachePort::new();
        store
            .put("k", Bytes::from_static(b"hello"), "image/jpeg".into(), meta())
            .await
            .unwrap();
        let head = store.head("k").await.unwrap().unwrap();
        assert_eq!(head.size, 5);
    }

    #[tokio::test]
    async fn get_range_slices_stored_body() {
        let store = InMemoryCachePort::new();
        store
            .put("k", Bytes::from_static(b"0123456789"), "application/octet-stream".into(), meta())
            .await
            .unwrap();
        let ranged = store.get_range("k", 2, 3).await.unwrap().unwrap();
        assert_eq!(ranged.body, Bytes::from_static(b"234"));
    }

    #[tokio::test]
    async fn missing_key_is_none_not_error() {
        let store = InMemoryCachePort::new();
        assert!(store.get("missing").await.unwrap().is_none());
        assert!(store.head("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = InMemoryCachePort::new();
        store
            .put("k", Bytes::from_static(b"x"), "image/png".into(), meta())
            .await
            .unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[test]
    fn etag_is_deterministic_for_same_bytes() {
        assert_eq!(generate_etag(b"hello"), generate_etag(b"hello"));
        assert_ne!(generate_etag(b"hello"), generate_etag(b"world"));
    }
}
