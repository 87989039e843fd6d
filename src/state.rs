//! Per-request state tracking.
//!
//! Each handler owns a single mutable record for the lifetime of a request.
//! It captures what happened at every stage (parse, cache, storage, archive,
//! response write) and is read exactly once on handler exit to emit a
//! structured log line and a metrics record.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::storage::{Condition, TileJsonFormat};
use crate::tile::TileCoord;

// =============================================================================
// Outcome enums
// =============================================================================

/// Terminal outcome of a request, mapped to the HTTP status code.
///
/// `Nil` at handler exit indicates a programming error and is logged as such.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub enum ResponseState {
    #[default]
    Nil,
    Success,
    NotModified,
    NotFound,
    BadRequest,
    Error,
}

impl ResponseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseState::Nil => "nil",
            ResponseState::Success => "ok",
            ResponseState::NotModified => "notmod",
            ResponseState::NotFound => "notfound",
            ResponseState::BadRequest => "badreq",
            ResponseState::Error => "err",
        }
    }

    pub fn as_status_code(&self) -> u16 {
        match self {
            ResponseState::Nil => 0,
            ResponseState::Success => 200,
            ResponseState::NotModified => 304,
            ResponseState::NotFound => 404,
            ResponseState::BadRequest => 400,
            ResponseState::Error => 500,
        }
    }
}

/// Outcome of the storage stage alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub enum FetchState {
    #[default]
    Nil,
    Success,
    NotFound,
    FetchError,
    ReadError,
    ConfigError,
}

impl FetchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchState::Nil => "nil",
            FetchState::Success => "ok",
            FetchState::NotFound => "notfound",
            FetchState::FetchError => "fetcherr",
            FetchState::ReadError => "readerr",
            FetchState::ConfigError => "configerr",
        }
    }
}

// =============================================================================
// Parse results
// =============================================================================

/// Request attributes captured for logging.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestData {
    pub path: String,
    pub api_key: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

/// Route-specific payload of a parse result.
#[derive(Debug, Clone)]
pub enum ParseKind {
    Metatile { coord: TileCoord },
    TileJson { format: TileJsonFormat },
}

/// Everything the parser derives from an incoming request.
#[derive(Debug, Clone)]
pub struct ParseResult {
    pub kind: ParseKind,
    pub cond: Condition,
    pub content_type: String,
    pub http_data: HttpRequestData,
    /// Opaque data-generation token from the `buildid` query parameter;
    /// overrides the storage prefix and namespaces cache keys.
    pub build_id: Option<String>,
    /// Set when the conditional headers carried an unparseable date; the
    /// request proceeds without the condition.
    pub cond_error: Option<crate::error::CondParseError>,
}

impl ParseResult {
    /// The tile coordinate, when this is a metatile parse result.
    pub fn coord(&self) -> Option<&TileCoord> {
        match &self.kind {
            ParseKind::Metatile { coord } => Some(coord),
            ParseKind::TileJson { .. } => None,
        }
    }
}

// =============================================================================
// Cacheable response payloads
// =============================================================================

/// The cacheable unit returned to clients for a vector tile request.
///
/// Round-trippable through the cache codec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorTileResponseData {
    pub content_type: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub response_state: ResponseState,
    pub data: Vec<u8>,
}

/// A whole metatile archive as cached between storage and the ZIP reader.
///
/// `offset` is resolved per request after retrieval; it is carried here so
/// the handler can thread one value through the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetatileResponseData {
    pub data: Vec<u8>,
    pub body_size: u64,
    pub offset: Option<TileCoord>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub response_state: ResponseState,
}

// =============================================================================
// Request state
// =============================================================================

/// Sizes observed while buffering the storage body.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchSize {
    pub body_size: u64,
    pub bytes_length: u64,
    pub bytes_cap: u64,
}

/// Which optional metadata the storage response carried.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageMetadata {
    pub has_last_modified: bool,
    pub has_etag: bool,
}

/// Cache hit flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheData {
    pub vector_cache_hit: bool,
    pub metatile_cache_hit: bool,
}

/// Wall-clock time spent in each stage of the metatile pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageDurations {
    pub parse: Duration,
    pub cache_lookup: Duration,
    pub cache_set: Duration,
    pub storage_fetch: Duration,
    pub storage_read: Duration,
    pub metatile_find: Duration,
    pub resp_write: Duration,
    pub total: Duration,
}

/// Transient per-request record for the metatile route.
///
/// Created at handler entry, mutated only by the handling task, read once on
/// exit for logging and metrics. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct RequestState {
    pub response_state: ResponseState,
    pub fetch_state: FetchState,
    pub fetch_size: FetchSize,
    pub storage_metadata: StorageMetadata,
    pub cache: CacheData,
    pub is_zip_error: bool,
    pub is_response_write_error: bool,
    pub is_cond_error: bool,
    pub is_cache_lookup_error: bool,
    pub duration: StageDurations,
    pub coord: Option<TileCoord>,
    pub http_data: HttpRequestData,
    pub format: Option<String>,
    pub response_size: u64,
}

impl RequestState {
    /// Serialize to the structured log record.
    ///
    /// Top-level keys: `fetch` (when a fetch happened), `error` (omitted when
    /// empty), `timing`, `http`, `coord`, `cache`. Timings in milliseconds.
    pub fn as_json_map(&self) -> Value {
        let mut result = serde_json::Map::new();

        if self.fetch_state > FetchState::Nil {
            let mut fetch = serde_json::Map::new();
            fetch.insert("state".into(), json!(self.fetch_state.as_str()));
            if self.fetch_size.body_size > 0 {
                fetch.insert(
                    "size".into(),
                    json!({
                        "body": self.fetch_size.body_size,
                        "bytes_len": self.fetch_size.bytes_length,
                        "bytes_cap": self.fetch_size.bytes_cap,
                    }),
                );
            }
            fetch.insert(
                "metadata".into(),
                json!({
                    "has_last_modified": self.storage_metadata.has_last_modified,
                    "has_etag": self.storage_metadata.has_etag,
                }),
            );
            result.insert("fetch".into(), Value::Object(fetch));
        }

        let mut errors = serde_json::Map::new();
        if self.is_zip_error {
            errors.insert("zip".into(), json!(true));
        }
        if self.is_response_write_error {
            errors.insert("response_write".into(), json!(true));
        }
        if self.is_cond_error {
            errors.insert("cond".into(), json!(true));
        }
        if self.is_cache_lookup_error {
            errors.insert("cache_lookup".into(), json!(true));
        }
        if !errors.is_empty() {
            result.insert("error".into(), Value::Object(errors));
        }

        result.insert(
            "timing".into(),
            json!({
                "parse": millis(self.duration.parse),
                "cache_lookup": millis(self.duration.cache_lookup),
                "cache_set": millis(self.duration.cache_set),
                "storage_fetch": millis(self.duration.storage_fetch),
                "storage_read": millis(self.duration.storage_read),
                "metatile_find": millis(self.duration.metatile_find),
                "resp_write": millis(self.duration.resp_write),
                "total": millis(self.duration.total),
            }),
        );

        let mut http = serde_json::Map::new();
        http.insert("path".into(), json!(self.http_data.path));
        if let Some(user_agent) = &self.http_data.user_agent {
            http.insert("user_agent".into(), json!(user_agent));
        }
        if let Some(referrer) = &self.http_data.referrer {
            http.insert("referer".into(), json!(referrer));
        }
        if let Some(api_key) = &self.http_data.api_key {
            http.insert("api_key".into(), json!(api_key));
        }
        if let Some(format) = &self.format {
            http.insert("format".into(), json!(format));
        }
        if let Some(coord) = &self.coord {
            result.insert(
                "coord".into(),
                json!({ "x": coord.x, "y": coord.y, "z": coord.z }),
            );
            http.insert("format".into(), json!(coord.format));
        }
        if self.response_size > 0 {
            http.insert("response_size".into(), json!(self.response_size));
        }
        http.insert("status".into(), json!(self.response_state.as_status_code()));
        result.insert("http".into(), Value::Object(http));

        result.insert(
            "cache".into(),
            json!({
                "vector_hit": self.cache.vector_cache_hit,
                "metatile_hit": self.cache.metatile_cache_hit,
            }),
        );

        Value::Object(result)
    }
}

// =============================================================================
// TileJson request state
// =============================================================================

/// Stage timings for the shorter tilejson pipeline. The storage read and
/// response write happen in one copy, so they share a timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TileJsonDurations {
    pub parse: Duration,
    pub storage_fetch: Duration,
    pub storage_read_resp_write: Duration,
    pub total: Duration,
}

/// Transient per-request record for the tilejson route.
#[derive(Debug, Clone, Default)]
pub struct TileJsonRequestState {
    pub duration: TileJsonDurations,
    pub format: Option<TileJsonFormat>,
    pub response_state: ResponseState,
    pub fetch_state: FetchState,
    pub fetch_size: u64,
    pub storage_metadata: StorageMetadata,
    pub is_cond_error: bool,
    pub is_response_write_error: bool,
    pub http_data: HttpRequestData,
}

impl TileJsonRequestState {
    pub fn as_json_map(&self) -> Value {
        let mut result = serde_json::Map::new();

        if self.fetch_state > FetchState::Nil {
            let mut fetch = serde_json::Map::new();
            fetch.insert("state".into(), json!(self.fetch_state.as_str()));
            if self.fetch_size > 0 {
                fetch.insert("size".into(), json!(self.fetch_size));
            }
            fetch.insert(
                "metadata".into(),
                json!({
                    "has_last_modified": self.storage_metadata.has_last_modified,
                    "has_etag": self.storage_metadata.has_etag,
                }),
            );
            result.insert("fetch".into(), Value::Object(fetch));
        }

        let mut errors = serde_json::Map::new();
        if self.is_response_write_error {
            errors.insert("response_write".into(), json!(true));
        }
        if self.is_cond_error {
            errors.insert("cond".into(), json!(true));
        }
        if !errors.is_empty() {
            result.insert("error".into(), Value::Object(errors));
        }

        result.insert(
            "timing".into(),
            json!({
                "parse": millis(self.duration.parse),
                "storage_fetch": millis(self.duration.storage_fetch),
                "storage_read_resp_write": millis(self.duration.storage_read_resp_write),
                "total": millis(self.duration.total),
            }),
        );

        let mut http = serde_json::Map::new();
        http.insert("path".into(), json!(self.http_data.path));
        if let Some(user_agent) = &self.http_data.user_agent {
            http.insert("user_agent".into(), json!(user_agent));
        }
        if let Some(referrer) = &self.http_data.referrer {
            http.insert("referer".into(), json!(referrer));
        }
        if let Some(api_key) = &self.http_data.api_key {
            http.insert("api_key".into(), json!(api_key));
        }
        if let Some(format) = &self.format {
            http.insert("format".into(), json!(format.name()));
        }
        http.insert("status".into(), json!(self.response_state.as_status_code()));
        result.insert("http".into(), Value::Object(http));

        Value::Object(result)
    }
}

fn millis(d: Duration) -> i64 {
    d.as_millis() as i64
}

/// Convenience for tests and parsers: index a JSON object by key path.
#[cfg(test)]
pub(crate) fn json_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

/// Map of path variables captured by the router.
pub type PathVars = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_state_status_codes() {
        assert_eq!(ResponseState::Nil.as_status_code(), 0);
        assert_eq!(ResponseState::Success.as_status_code(), 200);
        assert_eq!(ResponseState::NotModified.as_status_code(), 304);
        assert_eq!(ResponseState::NotFound.as_status_code(), 404);
        assert_eq!(ResponseState::BadRequest.as_status_code(), 400);
        assert_eq!(ResponseState::Error.as_status_code(), 500);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ResponseState::Success.as_str(), "ok");
        assert_eq!(ResponseState::NotModified.as_str(), "notmod");
        assert_eq!(FetchState::FetchError.as_str(), "fetcherr");
        assert_eq!(FetchState::ConfigError.as_str(), "configerr");
    }

    #[test]
    fn test_json_map_minimal() {
        let state = RequestState::default();
        let map = state.as_json_map();

        // no fetch performed, so the fetch key is omitted
        assert!(map.get("fetch").is_none());
        assert!(map.get("error").is_none());
        assert_eq!(
            json_path(&map, &["http", "status"]),
            Some(&json!(0)),
            "nil response state logs status 0"
        );
        assert_eq!(
            json_path(&map, &["cache", "vector_hit"]),
            Some(&json!(false))
        );
        assert!(map.get("timing").is_some());
    }

    #[test]
    fn test_json_map_full_request() {
        let state = RequestState {
            response_state: ResponseState::Success,
            fetch_state: FetchState::Success,
            fetch_size: FetchSize {
                body_size: 1024,
                bytes_length: 1024,
                bytes_cap: 4096,
            },
            storage_metadata: StorageMetadata {
                has_last_modified: true,
                has_etag: false,
            },
            coord: Some(TileCoord::new(12, 637, 936, "json")),
            format: Some("json".to_string()),
            response_size: 2,
            http_data: HttpRequestData {
                path: "/all/12/637/936.json".to_string(),
                api_key: Some("abc".to_string()),
                user_agent: Some("test-agent".to_string()),
                referrer: None,
            },
            duration: StageDurations {
                total: Duration::from_millis(42),
                ..Default::default()
            },
            ..Default::default()
        };

        let map = state.as_json_map();
        assert_eq!(json_path(&map, &["fetch", "state"]), Some(&json!("ok")));
        assert_eq!(
            json_path(&map, &["fetch", "size", "body"]),
            Some(&json!(1024))
        );
        assert_eq!(
            json_path(&map, &["fetch", "metadata", "has_last_modified"]),
            Some(&json!(true))
        );
        assert_eq!(json_path(&map, &["coord", "x"]), Some(&json!(637)));
        assert_eq!(json_path(&map, &["http", "status"]), Some(&json!(200)));
        assert_eq!(
            json_path(&map, &["http", "response_size"]),
            Some(&json!(2))
        );
        assert_eq!(json_path(&map, &["timing", "total"]), Some(&json!(42)));
        assert!(map.get("error").is_none());
    }

    #[test]
    fn test_json_map_error_flags() {
        let state = RequestState {
            is_zip_error: true,
            is_cond_error: true,
            ..Default::default()
        };
        let map = state.as_json_map();
        assert_eq!(json_path(&map, &["error", "zip"]), Some(&json!(true)));
        assert_eq!(json_path(&map, &["error", "cond"]), Some(&json!(true)));
        assert!(json_path(&map, &["error", "response_write"]).is_none());
    }

    #[test]
    fn test_tilejson_json_map() {
        let state = TileJsonRequestState {
            response_state: ResponseState::Success,
            fetch_state: FetchState::Success,
            fetch_size: 512,
            format: Some(TileJsonFormat::Mvt),
            http_data: HttpRequestData {
                path: "/tilejson/mapbox.json".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let map = state.as_json_map();
        assert_eq!(json_path(&map, &["fetch", "size"]), Some(&json!(512)));
        assert_eq!(
            json_path(&map, &["http", "format"]),
            Some(&json!("mapbox"))
        );
        assert!(json_path(&map, &["timing", "storage_read_resp_write"]).is_some());
    }
}
