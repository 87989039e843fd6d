//! Cache layer for vector tile responses, whole metatiles and raw objects.
//!
//! Every backend implements raw `get`/`set`; the typed tile and metatile
//! helpers are provided on top of them so all backends share one key scheme
//! and one codec. A no-op implementation is always available, which keeps
//! handlers free of nil checks.
//!
//! # Keys
//!
//! - vector tile: `vector:{buildid}:{z}/{x}/{y}.{fmt}`
//! - metatile:    `metatile:{buildid}:{z}/{x}/{y}.{fmt}` (over the metatile
//!   coordinate)
//!
//! The build id defaults to `default` when the request carried none, so
//! entries written under one build id are never served to another.

mod dynamodb;
mod memory;
mod redis;

pub use dynamodb::DynamoDbCache;
pub use memory::InMemoryCache;
pub use redis::RedisCache;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;
use crate::state::{MetatileResponseData, ParseResult, VectorTileResponseData};
use crate::tile::TileCoord;

// =============================================================================
// Keys and codec
// =============================================================================

/// Cache key for a vector tile response.
///
/// Only metatile parse results produce keys; tilejson requests do not cache.
pub fn vector_tile_key(req: &ParseResult) -> Option<String> {
    let coord = req.coord()?;
    Some(format!("vector:{}:{}", build_id_of(req), coord.file_name()))
}

/// Cache key for a whole metatile archive, over the metatile coordinate.
pub fn metatile_key(req: &ParseResult, meta_coord: &TileCoord) -> String {
    format!("metatile:{}:{}", build_id_of(req), meta_coord.file_name())
}

fn build_id_of(req: &ParseResult) -> &str {
    match req.build_id.as_deref() {
        Some(id) if !id.is_empty() => id,
        _ => "default",
    }
}

/// Encode a response struct with the self-describing msgpack codec.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    rmp_serde::to_vec_named(value).map_err(|e| CacheError::Codec(e.to_string()))
}

/// Decode a cached value; a decode failure is reported as an error so the
/// caller can log it, but is treated as a miss.
pub fn decode<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T, CacheError> {
    rmp_serde::from_slice(raw).map_err(|e| CacheError::Codec(e.to_string()))
}

// =============================================================================
// Contract
// =============================================================================

/// Key/value byte store with typed helpers for the two response shapes.
///
/// Callers bound every round-trip with a timeout derived from the request
/// context; backends themselves just issue the operation.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Whether metatile-level entries are worth writing here. Lets handlers
    /// skip cloning whole archives when the cache would swallow them.
    fn supports_metatiles(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    async fn get_tile(
        &self,
        req: &ParseResult,
    ) -> Result<Option<VectorTileResponseData>, CacheError> {
        let Some(key) = vector_tile_key(req) else {
            return Ok(None);
        };
        match self.get(&key).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_tile(
        &self,
        req: &ParseResult,
        data: &VectorTileResponseData,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let Some(key) = vector_tile_key(req) else {
            return Ok(());
        };
        self.set(&key, encode(data)?, ttl).await
    }

    async fn get_metatile(
        &self,
        req: &ParseResult,
        meta_coord: &TileCoord,
    ) -> Result<Option<MetatileResponseData>, CacheError> {
        let key = metatile_key(req, meta_coord);
        match self.get(&key).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_metatile(
        &self,
        req: &ParseResult,
        meta_coord: &TileCoord,
        data: &MetatileResponseData,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let key = metatile_key(req, meta_coord);
        self.set(&key, encode(data)?, ttl).await
    }
}

/// The always-available no-op cache: every get misses, every set is
/// swallowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

#[async_trait]
impl Cache for NullCache {
    fn supports_metatiles(&self) -> bool {
        false
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(None)
    }

    async fn set(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        Ok(())
    }
}
