//! Backing stores for metatiles and tilejson documents.
//!
//! Two implementations satisfy one contract: an object-keyed S3 store and a
//! filesystem store. Handlers consume the contract abstractly; `NotFound` and
//! `NotModified` are ordinary response variants, not errors.

mod file;
mod s3;

pub use file::FileStorage;
pub use s3::{create_s3_client, S3Storage};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::tile::TileCoord;

// =============================================================================
// Conditions
// =============================================================================

/// HTTP preconditions carried unchanged from the incoming request to the
/// backing store fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Condition {
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_none_match: Option<String>,
}

impl Condition {
    pub fn is_empty(&self) -> bool {
        self.if_modified_since.is_none() && self.if_none_match.is_none()
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Body of a successful storage response.
///
/// The S3 adapter yields a stream which the caller drains into a buffer; the
/// filesystem adapter and the cache path yield owned bytes.
pub enum StorageBody {
    Bytes(Bytes),
    Stream(aws_sdk_s3::primitives::ByteStream),
}

impl StorageBody {
    /// Drain the body into `out`, returning the number of bytes read.
    pub async fn read_into(self, out: &mut Vec<u8>) -> Result<u64, StorageError> {
        match self {
            StorageBody::Bytes(bytes) => {
                out.extend_from_slice(&bytes);
                Ok(bytes.len() as u64)
            }
            StorageBody::Stream(mut stream) => {
                let mut total = 0u64;
                while let Some(chunk) = stream
                    .try_next()
                    .await
                    .map_err(|e| StorageError::Read(e.to_string()))?
                {
                    total += chunk.len() as u64;
                    out.extend_from_slice(&chunk);
                }
                Ok(total)
            }
        }
    }

    /// Collect the body into a contiguous byte sequence.
    pub async fn into_bytes(self) -> Result<Bytes, StorageError> {
        match self {
            StorageBody::Bytes(bytes) => Ok(bytes),
            StorageBody::Stream(stream) => Ok(stream
                .collect()
                .await
                .map_err(|e| StorageError::Read(e.to_string()))?
                .into_bytes()),
        }
    }
}

impl std::fmt::Debug for StorageBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBody::Bytes(bytes) => write!(f, "StorageBody::Bytes({} bytes)", bytes.len()),
            StorageBody::Stream(_) => write!(f, "StorageBody::Stream"),
        }
    }
}

/// A storage hit with its HTTP-relevant metadata.
#[derive(Debug)]
pub struct SuccessfulResponse {
    pub body: StorageBody,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    /// From Content-Length when the backend reports one; zero otherwise.
    pub size: u64,
}

/// Tri-state result of a storage fetch.
#[derive(Debug)]
pub enum StorageResponse {
    Success(SuccessfulResponse),
    NotFound,
    NotModified,
}

// =============================================================================
// TileJson
// =============================================================================

/// The three known tilejson document flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileJsonFormat {
    Mvt,
    Json,
    Topojson,
}

impl TileJsonFormat {
    /// The name used in tilejson storage keys and request paths.
    pub fn name(&self) -> &'static str {
        match self {
            TileJsonFormat::Mvt => "mapbox",
            TileJsonFormat::Json => "geojson",
            TileJsonFormat::Topojson => "topojson",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mapbox" => Some(TileJsonFormat::Mvt),
            "geojson" => Some(TileJsonFormat::Json),
            "topojson" => Some(TileJsonFormat::Topojson),
            _ => None,
        }
    }
}

// =============================================================================
// Contract
// =============================================================================

/// Uniform interface over the backing stores.
///
/// All implementations are internally synchronized; concurrent calls on a
/// shared handle are safe.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Conditionally fetch the object for `coord`. `prefix_override` is the
    /// per-request build id, replacing the configured default prefix.
    async fn fetch(
        &self,
        coord: &TileCoord,
        cond: &Condition,
        prefix_override: Option<&str>,
    ) -> Result<StorageResponse, StorageError>;

    /// Fetch the tilejson metadata document for `format`.
    async fn tile_json(
        &self,
        format: TileJsonFormat,
        cond: &Condition,
        prefix_override: Option<&str>,
    ) -> Result<StorageResponse, StorageError>;

    /// Probe the configured sentinel object; Ok iff the store is reachable.
    async fn health_check(&self) -> Result<(), StorageError>;
}

/// Compute the 5-hex-char shard prefix for a hashed key string.
///
/// The hashed string must stay stable with the writer side: including or
/// excluding a leading slash or layer segment changes every object key.
pub(crate) fn hash_prefix(to_hash: &str) -> String {
    let digest = md5::compute(to_hash.as_bytes());
    format!("{:x}", digest)[..5].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tilejson_format_names() {
        assert_eq!(TileJsonFormat::Mvt.name(), "mapbox");
        assert_eq!(TileJsonFormat::Json.name(), "geojson");
        assert_eq!(TileJsonFormat::Topojson.name(), "topojson");
    }

    #[test]
    fn test_tilejson_format_from_name() {
        assert_eq!(TileJsonFormat::from_name("mapbox"), Some(TileJsonFormat::Mvt));
        assert_eq!(
            TileJsonFormat::from_name("geojson"),
            Some(TileJsonFormat::Json)
        );
        assert_eq!(
            TileJsonFormat::from_name("topojson"),
            Some(TileJsonFormat::Topojson)
        );
        assert_eq!(TileJsonFormat::from_name("png"), None);
        assert_eq!(TileJsonFormat::from_name(""), None);
    }

    #[test]
    fn test_condition_is_empty() {
        assert!(Condition::default().is_empty());
        let cond = Condition {
            if_none_match: Some("1234".to_string()),
            ..Default::default()
        };
        assert!(!cond.is_empty());
    }

    #[test]
    fn test_hash_prefix_is_stable() {
        // known md5("0/0/0.json") = 8e7a5...; five lowercase hex chars
        let hash = hash_prefix("0/0/0.json");
        assert_eq!(hash.len(), 5);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_prefix("0/0/0.json"));
        assert_ne!(hash, hash_prefix("/layer/0/0/0.json"));
    }

    #[tokio::test]
    async fn test_storage_body_bytes_read_into() {
        let body = StorageBody::Bytes(Bytes::from_static(b"hello"));
        let mut out = Vec::new();
        let n = body.read_into(&mut out).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_storage_body_into_bytes() {
        let body = StorageBody::Bytes(Bytes::from_static(b"abc"));
        assert_eq!(body.into_bytes().await.unwrap(), Bytes::from_static(b"abc"));
    }
}
