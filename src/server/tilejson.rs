//! The tilejson route handler.
//!
//! A shorter pipeline than the metatile route: parse → storage fetch →
//! write. TileJson documents are not cached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use crate::error::TileJsonParseError;
use crate::metrics::MetricsWriter;
use crate::server::metatile::plain_error;
use crate::server::parse::{format_http_date, TileJsonParser};
use crate::server::pattern::RoutePattern;
use crate::server::log_request;
use crate::state::{FetchState, ParseKind, PathVars, ResponseState, TileJsonRequestState};
use crate::storage::{Storage, StorageResponse};

/// Everything one tilejson route needs, shared across its requests.
#[derive(Clone)]
pub struct TileJsonRouteState {
    pub parser: Arc<TileJsonParser>,
    pub pattern: Arc<RoutePattern>,
    pub storage: Arc<dyn Storage>,
    pub metrics: Arc<dyn MetricsWriter>,
}

pub async fn tilejson_handler(
    State(ctx): State<TileJsonRouteState>,
    OriginalUri(uri): OriginalUri,
    Path(raw_vars): Path<PathVars>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let mut req_state = TileJsonRequestState::default();
    let start = Instant::now();

    let response =
        tilejson_pipeline(&ctx, uri.path(), &raw_vars, &query, &headers, &mut req_state).await;

    req_state.duration.total = start.elapsed();
    if req_state.response_state == ResponseState::Nil {
        error!(
            category = "invalid_code_state",
            "handler did not set response state for tilejson request"
        );
    }
    log_request(req_state.as_json_map());
    ctx.metrics.write_tilejson_state(&req_state);

    response
}

async fn tilejson_pipeline(
    ctx: &TileJsonRouteState,
    path: &str,
    raw_vars: &PathVars,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    req_state: &mut TileJsonRequestState,
) -> Response {
    let parse_start = Instant::now();
    let vars = ctx.pattern.extract(raw_vars);
    let parsed = ctx.parser.parse(path, &vars, query, headers);
    req_state.duration.parse = parse_start.elapsed();

    let parse_result = match parsed {
        Ok(result) => result,
        Err(err) => {
            warn!(category = "parse", "{}", err);
            let (status, state) = match &err {
                TileJsonParseError::Format(_) => {
                    (StatusCode::NOT_FOUND, ResponseState::NotFound)
                }
                TileJsonParseError::Cond(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, ResponseState::Error)
                }
            };
            req_state.response_state = state;
            return plain_error(status, "Not Found");
        }
    };

    req_state.http_data = parse_result.http_data.clone();
    let ParseKind::TileJson { format } = parse_result.kind else {
        req_state.response_state = ResponseState::Error;
        return plain_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "tilejson handler invoked with a non-tilejson parse result",
        );
    };
    req_state.format = Some(format);
    if let Some(cond_err) = &parse_result.cond_error {
        req_state.is_cond_error = true;
        warn!(category = "condition", "{}", cond_err);
    }

    let fetch_start = Instant::now();
    let fetched = ctx
        .storage
        .tile_json(format, &parse_result.cond, parse_result.build_id.as_deref())
        .await;
    req_state.duration.storage_fetch = fetch_start.elapsed();

    let success = match fetched {
        Err(err) => {
            warn!(category = "storage", "tilejson storage fetch failure: {}", err);
            req_state.response_state = ResponseState::Error;
            req_state.fetch_state = FetchState::FetchError;
            return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
        Ok(StorageResponse::NotFound) => {
            req_state.response_state = ResponseState::NotFound;
            req_state.fetch_state = FetchState::NotFound;
            return plain_error(StatusCode::NOT_FOUND, "Not Found");
        }
        Ok(StorageResponse::NotModified) => {
            req_state.fetch_state = FetchState::Success;
            req_state.response_state = ResponseState::NotModified;
            return StatusCode::NOT_MODIFIED.into_response();
        }
        Ok(StorageResponse::Success(success)) => success,
    };
    req_state.fetch_state = FetchState::Success;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, parse_result.content_type.as_str())
        .header(header::CONTENT_LENGTH, success.size);
    req_state.fetch_size = success.size;

    if let Some(last_modified) = &success.last_modified {
        builder = builder.header(header::LAST_MODIFIED, format_http_date(last_modified));
        req_state.storage_metadata.has_last_modified = true;
    }
    if let Some(etag) = &success.etag {
        builder = builder.header(header::ETAG, etag.as_str());
        req_state.storage_metadata.has_etag = true;
    }

    // drain and write in one step; the two share a timer
    let read_write_start = Instant::now();
    let body = match success.body.into_bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(category = "response", "failed to read tilejson body: {}", err);
            req_state.is_response_write_error = true;
            req_state.response_state = ResponseState::Error;
            return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };
    req_state.duration.storage_read_resp_write = read_write_start.elapsed();

    match builder.body(Body::from(body)) {
        Ok(response) => {
            req_state.response_state = ResponseState::Success;
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
