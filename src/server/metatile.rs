//! The metatile route handler.
//!
//! Pipeline per request:
//!
//! ```text
//! parse → vector cache lookup → compute meta/offset →
//!   metatile cache lookup → storage fetch → storage read →
//!   archive open → member extract → write response → cache set
//! ```
//!
//! Any stage may terminate early. The request state records what happened at
//! every stage and is flushed to the log and the metrics writer on exit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use crate::buffer::{BufferLease, BufferManager};
use crate::cache::Cache;
use crate::error::ParseError;
use crate::metrics::MetricsWriter;
use crate::server::parse::{format_http_date, MetatileParser};
use crate::server::pattern::RoutePattern;
use crate::server::{log_request, CACHE_SET_TIMEOUT, CACHE_TIMEOUT};
use crate::state::{
    FetchState, MetatileResponseData, ParseKind, ParseResult, PathVars, RequestState,
    ResponseState, VectorTileResponseData,
};
use crate::storage::{Storage, StorageResponse};
use crate::tile::{MetatileReader, TileCoord};

/// Everything one metatile route needs, shared across its requests.
#[derive(Clone)]
pub struct MetatileRouteState {
    pub parser: Arc<MetatileParser>,
    pub pattern: Arc<RoutePattern>,
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<dyn Cache>,
    pub buffers: Arc<dyn BufferManager>,
    pub metrics: Arc<dyn MetricsWriter>,
    pub metatile_size: u32,
    pub tile_size: u32,
    pub max_detail_zoom: i32,
}

pub async fn metatile_handler(
    State(ctx): State<MetatileRouteState>,
    OriginalUri(uri): OriginalUri,
    Path(raw_vars): Path<PathVars>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let mut req_state = RequestState::default();
    let start = Instant::now();

    let response = metatile_pipeline(&ctx, uri.path(), &raw_vars, &query, &headers, &mut req_state)
        .await;

    req_state.duration.total = start.elapsed();
    if req_state.response_state == ResponseState::Nil {
        error!(
            category = "invalid_code_state",
            "handler did not set response state for tile {:?}", req_state.coord
        );
    }
    log_request(req_state.as_json_map());
    ctx.metrics.write_metatile_state(&req_state);

    response
}

async fn metatile_pipeline(
    ctx: &MetatileRouteState,
    path: &str,
    raw_vars: &PathVars,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    req_state: &mut RequestState,
) -> Response {
    // Parse
    let parse_start = Instant::now();
    let vars = ctx.pattern.extract(raw_vars);
    let parsed = ctx.parser.parse(path, &vars, query, headers);
    req_state.duration.parse = parse_start.elapsed();

    let parse_result = match parsed {
        Ok(result) => result,
        Err(err) => {
            warn!(category = "parse", "{}", err);
            let (status, state) = match &err {
                ParseError::Mime(_) => (StatusCode::NOT_FOUND, ResponseState::NotFound),
                ParseError::Coord(_) => (StatusCode::BAD_REQUEST, ResponseState::BadRequest),
                // the parser folds condition problems into its result; one
                // surfacing here is a bug
                ParseError::Cond(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, ResponseState::Error)
                }
            };
            req_state.response_state = state;
            return plain_error(status, &err.to_string());
        }
    };

    req_state.http_data = parse_result.http_data.clone();
    if let ParseKind::Metatile { coord } = &parse_result.kind {
        req_state.coord = Some(coord.clone());
        req_state.format = Some(coord.format.clone());
    }
    if let Some(cond_err) = &parse_result.cond_error {
        req_state.is_cond_error = true;
        warn!(category = "condition", "{}", cond_err);
    }

    // Vector cache lookup
    let lookup_start = Instant::now();
    let cached = tokio::time::timeout(CACHE_TIMEOUT, ctx.cache.get_tile(&parse_result)).await;
    req_state.duration.cache_lookup = lookup_start.elapsed();
    let cached = match cached {
        Ok(Ok(hit)) => hit,
        Ok(Err(err)) => {
            req_state.is_cache_lookup_error = true;
            warn!(category = "response", "error checking cache: {}", err);
            None
        }
        Err(_) => {
            req_state.is_cache_lookup_error = true;
            warn!(category = "response", "cache lookup timed out");
            None
        }
    };

    if let Some(data) = cached {
        req_state.cache.vector_cache_hit = true;
        return write_vector_tile_response(req_state, data);
    }

    // Storage and archive stages
    let outcome = match extract_tile(ctx, &parse_result, req_state).await {
        Ok(outcome) => outcome,
        Err(message) => {
            return plain_error(StatusCode::INTERNAL_SERVER_ERROR, &message);
        }
    };

    match outcome.response.response_state {
        ResponseState::NotFound => {
            req_state.response_state = ResponseState::NotFound;
            return plain_error(StatusCode::NOT_FOUND, "Not Found");
        }
        ResponseState::NotModified => {
            req_state.response_state = ResponseState::NotModified;
            return StatusCode::NOT_MODIFIED.into_response();
        }
        _ => {}
    }

    // Populate the caches on a detached task so cache writes never hold up
    // the response.
    let set_start = Instant::now();
    spawn_cache_population(
        ctx,
        parse_result,
        outcome.response.clone(),
        outcome.metatile_for_cache,
    );
    req_state.duration.cache_set = set_start.elapsed();

    write_vector_tile_response(req_state, outcome.response)
}

struct ExtractOutcome {
    response: VectorTileResponseData,
    metatile_for_cache: Option<(TileCoord, MetatileResponseData)>,
}

/// Run the storage and archive stages, mutating the request state as each
/// one resolves. `Err` carries the message for a 500 body; non-error
/// terminal outcomes (404/304) come back as the response state.
async fn extract_tile(
    ctx: &MetatileRouteState,
    parse_result: &ParseResult,
    req_state: &mut RequestState,
) -> Result<ExtractOutcome, String> {
    let ParseKind::Metatile { coord } = &parse_result.kind else {
        req_state.response_state = ResponseState::Error;
        return Err("metatile handler invoked with a non-metatile parse result".to_string());
    };

    let mut response = VectorTileResponseData {
        content_type: parse_result.content_type.clone(),
        ..Default::default()
    };

    // Compute meta. A failure here is a configuration problem; no fetch has
    // been performed.
    let (meta_coord, offset) =
        match coord.meta_and_offset(ctx.metatile_size, ctx.tile_size, ctx.max_detail_zoom) {
            Ok(pair) => pair,
            Err(err) => {
                req_state.fetch_state = FetchState::ConfigError;
                req_state.response_state = ResponseState::Error;
                return Err(format!("meta and offset could not be calculated: {}", err));
            }
        };

    // Metatile cache lookup. Conditional requests bypass it so 304 semantics
    // stay with the storage backend.
    let mut cached_archive: Option<Vec<u8>> = None;
    if ctx.cache.supports_metatiles() && parse_result.cond.is_empty() {
        let lookup_start = Instant::now();
        match tokio::time::timeout(
            CACHE_TIMEOUT,
            ctx.cache.get_metatile(parse_result, &meta_coord),
        )
        .await
        {
            Ok(Ok(Some(cached))) => {
                req_state.cache.metatile_cache_hit = true;
                req_state.fetch_state = FetchState::Success;
                req_state.fetch_size.body_size = cached.body_size;
                req_state.fetch_size.bytes_length = cached.data.len() as u64;
                req_state.fetch_size.bytes_cap = cached.data.len() as u64;
                if let Some(last_modified) = cached.last_modified {
                    response.last_modified = Some(last_modified);
                    req_state.storage_metadata.has_last_modified = true;
                }
                if let Some(etag) = cached.etag.clone() {
                    response.etag = Some(etag);
                    req_state.storage_metadata.has_etag = true;
                }
                cached_archive = Some(cached.data);
            }
            Ok(Ok(None)) => {}
            Ok(Err(err)) => {
                req_state.is_cache_lookup_error = true;
                warn!(category = "response", "error checking metatile cache: {}", err);
            }
            Err(_) => {
                req_state.is_cache_lookup_error = true;
                warn!(category = "response", "metatile cache lookup timed out");
            }
        }
        req_state.duration.cache_lookup += lookup_start.elapsed();
    }

    // Storage fetch and read, unless the cache already supplied the archive.
    let mut fetched_buf: Option<BufferLease<'_>> = None;
    if cached_archive.is_none() {
        let fetch_start = Instant::now();
        let fetched = ctx
            .storage
            .fetch(
                &meta_coord,
                &parse_result.cond,
                parse_result.build_id.as_deref(),
            )
            .await;
        req_state.duration.storage_fetch = fetch_start.elapsed();

        let success = match fetched {
            Err(err) => {
                req_state.fetch_state = FetchState::FetchError;
                req_state.response_state = ResponseState::Error;
                return Err(format!("metatile storage fetch failure: {}", err));
            }
            Ok(StorageResponse::NotFound) => {
                req_state.fetch_state = FetchState::NotFound;
                req_state.response_state = ResponseState::NotFound;
                response.response_state = ResponseState::NotFound;
                return Ok(ExtractOutcome {
                    response,
                    metatile_for_cache: None,
                });
            }
            Ok(StorageResponse::NotModified) => {
                req_state.fetch_state = FetchState::Success;
                req_state.response_state = ResponseState::NotModified;
                response.response_state = ResponseState::NotModified;
                return Ok(ExtractOutcome {
                    response,
                    metatile_for_cache: None,
                });
            }
            Ok(StorageResponse::Success(success)) => success,
        };
        req_state.fetch_state = FetchState::Success;

        if let Some(last_modified) = success.last_modified {
            response.last_modified = Some(last_modified);
            req_state.storage_metadata.has_last_modified = true;
        }
        if let Some(etag) = success.etag.clone() {
            response.etag = Some(etag);
            req_state.storage_metadata.has_etag = true;
        }

        // The whole metatile is buffered; the archive reader needs random
        // access and the total length.
        let mut buf = BufferLease::new(ctx.buffers.as_ref());
        let read_start = Instant::now();
        let body_size = match success.body.read_into(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                req_state.fetch_state = FetchState::ReadError;
                req_state.response_state = ResponseState::Error;
                return Err(format!("failed to read storage body: {}", err));
            }
        };
        req_state.duration.storage_read = read_start.elapsed();
        req_state.fetch_size.body_size = body_size;
        req_state.fetch_size.bytes_length = buf.len() as u64;
        req_state.fetch_size.bytes_cap = buf.capacity() as u64;
        fetched_buf = Some(buf);
    }

    let archive_bytes: &[u8] = match (&cached_archive, &fetched_buf) {
        (Some(bytes), _) => bytes.as_slice(),
        (None, Some(buf)) => buf.as_slice(),
        (None, None) => {
            req_state.response_state = ResponseState::Error;
            return Err("no metatile bytes available".to_string());
        }
    };

    // Open the archive and locate the member.
    let find_start = Instant::now();
    let reader = MetatileReader::open(archive_bytes);
    req_state.duration.metatile_find = find_start.elapsed();
    let mut reader = match reader {
        Ok(reader) => reader,
        Err(err) => {
            req_state.is_zip_error = true;
            req_state.response_state = ResponseState::Error;
            return Err(format!("failed to read metatile: {}", err));
        }
    };

    let mut tile_buf = BufferLease::new(ctx.buffers.as_ref());
    let uncompressed_size = match reader.extract(&offset, &mut tile_buf) {
        Ok(size) => size,
        Err(err) => {
            req_state.is_zip_error = true;
            req_state.response_state = ResponseState::Error;
            return Err(format!("failed to read tile out of metatile: {}", err));
        }
    };
    req_state.response_size = uncompressed_size;
    response.data = tile_buf.to_vec();
    response.response_state = ResponseState::Success;

    let metatile_for_cache = if ctx.cache.supports_metatiles()
        && !req_state.cache.metatile_cache_hit
        && parse_result.cond.is_empty()
    {
        Some((
            meta_coord.clone(),
            MetatileResponseData {
                data: archive_bytes.to_vec(),
                body_size: req_state.fetch_size.body_size,
                offset: Some(offset.clone()),
                last_modified: response.last_modified,
                etag: response.etag.clone(),
                response_state: ResponseState::Success,
            },
        ))
    } else {
        None
    };

    Ok(ExtractOutcome {
        response,
        metatile_for_cache,
    })
}

/// Assemble the 200 response for a vector tile, propagating the storage
/// metadata headers.
fn write_vector_tile_response(
    req_state: &mut RequestState,
    data: VectorTileResponseData,
) -> Response {
    let write_start = Instant::now();

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, data.content_type.as_str())
        .header(header::CONTENT_LENGTH, data.data.len());

    if let Some(last_modified) = &data.last_modified {
        builder = builder.header(header::LAST_MODIFIED, format_http_date(last_modified));
        req_state.storage_metadata.has_last_modified = true;
    }
    if let Some(etag) = &data.etag {
        builder = builder.header(header::ETAG, etag.as_str());
        req_state.storage_metadata.has_etag = true;
    }

    match builder.body(Body::from(data.data)) {
        Ok(response) => {
            req_state.response_state = ResponseState::Success;
            req_state.duration.resp_write = write_start.elapsed();
            response
        }
        Err(err) => {
            error!(category = "response", "failed to build response: {}", err);
            req_state.is_response_write_error = true;
            req_state.response_state = ResponseState::Error;
            plain_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

fn spawn_cache_population(
    ctx: &MetatileRouteState,
    parse_result: ParseResult,
    data: VectorTileResponseData,
    metatile: Option<(TileCoord, MetatileResponseData)>,
) {
    let cache = Arc::clone(&ctx.cache);
    tokio::spawn(async move {
        let result = tokio::time::timeout(CACHE_SET_TIMEOUT, async {
            if let Err(err) = cache.set_tile(&parse_result, &data, None).await {
                warn!(category = "response", "failed to set tile cache: {}", err);
            }
            if let Some((meta_coord, metatile_data)) = &metatile {
                if let Err(err) = cache
                    .set_metatile(&parse_result, meta_coord, metatile_data, None)
                    .await
                {
                    warn!(category = "response", "failed to set metatile cache: {}", err);
                }
            }
        })
        .await;
        if result.is_err() {
            warn!(category = "response", "cache set timed out");
        }
    });
}

/// Plain-text error body, newline-terminated.
pub(crate) fn plain_error(status: StatusCode, message: &str) -> Response {
    (status, format!("{}\n", message)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_write_vector_tile_response_headers() {
        let mut req_state = RequestState::default();
        let data = VectorTileResponseData {
            content_type: "application/json".to_string(),
            last_modified: Some(chrono::Utc.with_ymd_and_hms(2016, 11, 17, 12, 27, 0).unwrap()),
            etag: Some("1234".to_string()),
            response_state: ResponseState::Success,
            data: b"{}".to_vec(),
        };

        let response = write_vector_tile_response(&mut req_state, data);

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), "2");
        assert_eq!(
            headers.get(header::LAST_MODIFIED).unwrap(),
            "Thu, 17 Nov 2016 12:27:00 GMT"
        );
        assert_eq!(headers.get(header::ETAG).unwrap(), "1234");

        assert_eq!(req_state.response_state, ResponseState::Success);
        assert!(req_state.storage_metadata.has_last_modified);
        assert!(req_state.storage_metadata.has_etag);
    }

    #[test]
    fn test_write_vector_tile_response_without_metadata() {
        let mut req_state = RequestState::default();
        let data = VectorTileResponseData {
            content_type: "application/x-protobuf".to_string(),
            data: vec![1, 2, 3],
            ..Default::default()
        };

        let response = write_vector_tile_response(&mut req_state, data);
        assert!(response.headers().get(header::LAST_MODIFIED).is_none());
        assert!(response.headers().get(header::ETAG).is_none());
        assert!(!req_state.storage_metadata.has_last_modified);
    }
}
