//! S3-backed storage implementation.
//!
//! Object keys are built from an operator-configured template interpolated
//! with `{z}`, `{x}`, `{y}`, `{fmt}`, `{hash}`, `{prefix}` and `{layer}`.
//! Conditional request headers are mapped straight onto the S3 GET, and the
//! 304/404 outcomes are folded into the `StorageResponse` variants.

use std::collections::HashMap;
use std::sync::Arc;

use aws_sdk_s3::primitives::DateTime as AwsDateTime;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::error::StorageError;
use crate::storage::{
    hash_prefix, Condition, StorageBody, StorageResponse, SuccessfulResponse, TileJsonFormat,
};
use crate::tile::TileCoord;

/// S3 implementation of the storage contract.
///
/// Optionally decorated with a raw object cache that short-circuits
/// unconditional fetches; the decoration never changes observable semantics
/// beyond latency.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    key_pattern: String,
    default_prefix: String,
    layer: String,
    healthcheck: String,
    object_cache: Option<Arc<dyn Cache>>,
}

/// Owned form of a successful response, as marshaled into the object cache.
#[derive(Debug, Serialize, Deserialize)]
struct CachedObject {
    body: Vec<u8>,
    last_modified: Option<DateTime<Utc>>,
    etag: Option<String>,
    size: u64,
}

impl S3Storage {
    pub fn new(
        client: Client,
        bucket: impl Into<String>,
        key_pattern: impl Into<String>,
        default_prefix: impl Into<String>,
        layer: impl Into<String>,
        healthcheck: impl Into<String>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            key_pattern: key_pattern.into(),
            default_prefix: default_prefix.into(),
            layer: layer.into(),
            healthcheck: healthcheck.into(),
            object_cache: None,
        }
    }

    /// Consult `cache` under `s3://{bucket}/{key}` before unconditional
    /// remote fetches, and populate it after successful ones.
    pub fn with_object_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.object_cache = Some(cache);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The 5-hex-char shard prefix for a tile key.
    ///
    /// Deployments written before tilequeue#344 included the layer and a
    /// leading slash in the hashed string; current ones hash the bare
    /// filename. The layer setting selects the branch, and must match the
    /// writer side or every key changes.
    fn s3_hash(&self, coord: &TileCoord) -> String {
        let file_name = coord.file_name();
        if self.layer.is_empty() {
            hash_prefix(&file_name)
        } else {
            hash_prefix(&format!("/{}/{}", self.layer, file_name))
        }
    }

    fn object_key(
        &self,
        coord: &TileCoord,
        prefix_override: Option<&str>,
    ) -> Result<String, StorageError> {
        let prefix = match prefix_override {
            Some(p) if !p.is_empty() => p,
            _ => self.default_prefix.as_str(),
        };

        let mut vars = HashMap::new();
        vars.insert("z", coord.z.to_string());
        vars.insert("x", coord.x.to_string());
        vars.insert("y", coord.y.to_string());
        vars.insert("fmt", coord.format.clone());
        vars.insert("hash", self.s3_hash(coord));
        vars.insert("prefix", prefix.to_string());
        vars.insert("layer", self.layer.clone());

        interpolate(&self.key_pattern, &vars)
    }

    async fn respond_with_key(
        &self,
        key: String,
        cond: &Condition,
    ) -> Result<StorageResponse, StorageError> {
        // The object cache only serves unconditional requests; conditional
        // semantics stay with the remote.
        let cacheable = self.object_cache.is_some() && cond.is_empty();
        let cache_key = format!("s3://{}/{}", self.bucket, key);

        if cacheable {
            if let Some(cached) = self.object_cache_lookup(&cache_key).await {
                return Ok(StorageResponse::Success(SuccessfulResponse {
                    size: cached.size,
                    last_modified: cached.last_modified,
                    etag: cached.etag,
                    body: StorageBody::Bytes(cached.body.into()),
                }));
            }
        }

        debug!("requesting s3://{}/{}", self.bucket, key);

        let mut request = self.client.get_object().bucket(&self.bucket).key(&key);
        if let Some(since) = cond.if_modified_since {
            request = request.if_modified_since(AwsDateTime::from_secs(since.timestamp()));
        }
        if let Some(etag) = &cond.if_none_match {
            request = request.if_none_match(etag.as_str());
        }

        let output = match request.send().await {
            Ok(output) => output,
            Err(err) => {
                if let Some(service_err) = err.as_service_error() {
                    if service_err.is_no_such_key() {
                        return Ok(StorageResponse::NotFound);
                    }
                }
                if let Some(raw) = err.raw_response() {
                    match raw.status().as_u16() {
                        304 => return Ok(StorageResponse::NotModified),
                        404 => return Ok(StorageResponse::NotFound),
                        _ => {}
                    }
                }
                return Err(StorageError::S3(err.to_string()));
            }
        };

        let last_modified = output
            .last_modified()
            .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos()));
        let etag = output.e_tag().map(str::to_string);
        let size = output.content_length().unwrap_or(0).max(0) as u64;
        let body = StorageBody::Stream(output.body);

        if cacheable {
            // populating the cache requires owned bytes, so the stream is
            // collected here instead of in the handler
            let bytes = body.into_bytes().await?;
            self.object_cache_store(
                &cache_key,
                &CachedObject {
                    body: bytes.to_vec(),
                    last_modified,
                    etag: etag.clone(),
                    size,
                },
            )
            .await;
            return Ok(StorageResponse::Success(SuccessfulResponse {
                body: StorageBody::Bytes(bytes),
                last_modified,
                etag,
                size,
            }));
        }

        Ok(StorageResponse::Success(SuccessfulResponse {
            body,
            last_modified,
            etag,
            size,
        }))
    }

    async fn object_cache_lookup(&self, cache_key: &str) -> Option<CachedObject> {
        let cache = self.object_cache.as_ref()?;
        match cache.get(cache_key).await {
            Ok(Some(raw)) => match rmp_serde::from_slice(&raw) {
                Ok(cached) => Some(cached),
                Err(err) => {
                    warn!("undecodable object cache entry for {}: {}", cache_key, err);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!("object cache lookup failed for {}: {}", cache_key, err);
                None
            }
        }
    }

    async fn object_cache_store(&self, cache_key: &str, object: &CachedObject) {
        let Some(cache) = self.object_cache.as_ref() else {
            return;
        };
        match rmp_serde::to_vec_named(object) {
            Ok(encoded) => {
                if let Err(err) = cache.set(cache_key, encoded, None).await {
                    warn!("object cache set failed for {}: {}", cache_key, err);
                }
            }
            Err(err) => warn!("object cache encode failed for {}: {}", cache_key, err),
        }
    }
}

#[async_trait::async_trait]
impl super::Storage for S3Storage {
    async fn fetch(
        &self,
        coord: &TileCoord,
        cond: &Condition,
        prefix_override: Option<&str>,
    ) -> Result<StorageResponse, StorageError> {
        let key = self.object_key(coord, prefix_override)?;
        self.respond_with_key(key, cond).await
    }

    async fn tile_json(
        &self,
        format: TileJsonFormat,
        cond: &Condition,
        prefix_override: Option<&str>,
    ) -> Result<StorageResponse, StorageError> {
        let to_hash = format!("/tilejson/{}.json", format.name());
        let hash = hash_prefix(&to_hash);
        let prefix = match prefix_override {
            Some(p) if !p.is_empty() => p,
            _ => self.default_prefix.as_str(),
        };
        let key = format!("{}/{}{}", prefix, hash, to_hash);
        self.respond_with_key(key, cond).await
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.healthcheck)
            .send()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;
        Ok(())
    }
}

/// Create an S3 client from the shared AWS environment, with optional region
/// and assumed role.
pub async fn create_s3_client(region: Option<&str>, role_arn: Option<&str>) -> Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(aws_config::Region::new(region.to_string()));
    }
    if let Some(role) = role_arn {
        let provider = aws_config::sts::AssumeRoleProvider::builder(role)
            .session_name("metatile-gateway")
            .build()
            .await;
        loader = loader.credentials_provider(provider);
    }
    let sdk_config = loader.load().await;
    Client::new(&sdk_config)
}

/// Fill a `{var}`-style template from the variable map. Unknown or unclosed
/// variables are configuration errors.
fn interpolate(pattern: &str, vars: &HashMap<&str, String>) -> Result<String, StorageError> {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| StorageError::KeyTemplate {
            pattern: pattern.to_string(),
            variable: after.to_string(),
        })?;
        let name = &after[..end];
        let value = vars.get(name).ok_or_else(|| StorageError::KeyTemplate {
            pattern: pattern.to_string(),
            variable: name.to_string(),
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}
