//! HTTP surface: parsers, route handlers and router construction.

mod health;
mod metatile;
mod parse;
mod pattern;
mod preview;
mod routes;
mod tilejson;

pub use health::{health_check_handler, readiness_handler, HealthCheckState, ReadinessFlag};
pub use metatile::{metatile_handler, MetatileRouteState};
pub use parse::{
    format_http_date, parse_condition, parse_http_data, parse_http_dates, MetatileParser,
    TileJsonParser,
};
pub use pattern::{PatternError, RoutePattern};
pub use preview::{preview_handler, PreviewPage};
pub use routes::{build_router, GatewayComponents};
pub use tilejson::{tilejson_handler, TileJsonRouteState};

use std::time::Duration;

/// Budget for a cache round-trip on the request path; an expiry is an
/// ordinary miss.
pub(crate) const CACHE_TIMEOUT: Duration = Duration::from_millis(100);

/// Budget for the detached post-response cache population.
pub(crate) const CACHE_SET_TIMEOUT: Duration = Duration::from_secs(1);

/// Emit the per-request structured record as a single `request` field.
pub(crate) fn log_request(record: serde_json::Value) {
    tracing::info!(target: "metatile_gateway::request", category = "metrics", request = %record);
}
