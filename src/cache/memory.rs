//! In-process LRU cache with size-based eviction.
//!
//! Useful for single-node deployments and tests. TTLs are not tracked;
//! entries only leave through LRU eviction.

use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::RwLock;

use crate::cache::Cache;
use crate::error::CacheError;

/// Default capacity: 64MB of cached values.
pub const DEFAULT_MEMORY_CACHE_CAPACITY: usize = 64 * 1024 * 1024;

/// Bound on the entry count, to keep LRU bookkeeping cheap.
const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Thread-safe LRU cache keyed by string, tracking total value bytes and
/// evicting least-recently-used entries past capacity.
pub struct InMemoryCache {
    entries: RwLock<LruCache<String, Vec<u8>>>,
    max_size: usize,
    current_size: RwLock<usize>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CACHE_CAPACITY)
    }

    /// Create a cache bounded to `max_size` total value bytes.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacity_and_entries(max_size, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity_and_entries(max_size: usize, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(
                NonZeroUsize::new(max_entries.max(1)).unwrap(),
            )),
            max_size,
            current_size: RwLock::new(0),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Current total size of cached values in bytes.
    pub async fn size(&self) -> usize {
        *self.current_size.read().await
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut entries = self.entries.write().await;
        Ok(entries.get(key).cloned())
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        _ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let value_size = value.len();
        let mut entries = self.entries.write().await;
        let mut current_size = self.current_size.write().await;

        if let Some(old) = entries.peek(key) {
            *current_size = current_size.saturating_sub(old.len());
        }

        entries.put(key.to_string(), value);
        *current_size += value_size;

        while *current_size > self.max_size {
            match entries.pop_lru() {
                Some((_, evicted)) => {
                    *current_size = current_size.saturating_sub(evicted.len());
                }
                None => break,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{HttpRequestData, ParseKind, ParseResult, VectorTileResponseData};
    use crate::storage::Condition;
    use crate::tile::TileCoord;

    #[tokio::test]
    async fn test_basic_get_set() {
        let cache = InMemoryCache::new();

        assert_eq!(cache.get("k").await.unwrap(), None);
        cache.set("k", vec![1, 2, 3], None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_size_tracking_and_update() {
        let cache = InMemoryCache::with_capacity(10_000);

        cache.set("a", vec![0u8; 1000], None).await.unwrap();
        assert_eq!(cache.size().await, 1000);

        cache.set("b", vec![0u8; 2000], None).await.unwrap();
        assert_eq!(cache.size().await, 3000);

        // updating a key replaces its contribution
        cache.set("a", vec![0u8; 500], None).await.unwrap();
        assert_eq!(cache.size().await, 2500);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_size_based_eviction() {
        let cache = InMemoryCache::with_capacity_and_entries(1000, 100);

        cache.set("a", vec![0u8; 400], None).await.unwrap();
        cache.set("b", vec![0u8; 400], None).await.unwrap();
        cache.set("c", vec![0u8; 400], None).await.unwrap();

        assert!(cache.size().await <= 1000);
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert!(cache.get("b").await.unwrap().is_some());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_typed_helpers_roundtrip() {
        let cache = InMemoryCache::new();
        let req = ParseResult {
            kind: ParseKind::Metatile {
                coord: TileCoord::new(3, 5, 7, "mvt"),
            },
            cond: Condition::default(),
            content_type: "application/x-protobuf".to_string(),
            http_data: HttpRequestData::default(),
            build_id: None,
            cond_error: None,
        };

        assert!(cache.get_tile(&req).await.unwrap().is_none());

        let data = VectorTileResponseData {
            content_type: "application/x-protobuf".to_string(),
            data: vec![7u8; 32],
            ..Default::default()
        };
        cache.set_tile(&req, &data, None).await.unwrap();

        let cached = cache.get_tile(&req).await.unwrap().unwrap();
        assert_eq!(cached, data);
    }
}
