//! Router construction from the handler config.
//!
//! Every configured pattern becomes one route with its own resolved storage
//! and sizes; health, readiness and preview routes are added from the
//! operator flags. CORS, gzip compression and request tracing wrap the
//! whole router.

use std::collections::HashMap;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::buffer::BufferManager;
use crate::cache::Cache;
use crate::config::{Config, HandlerConfig, ResolvedRoute};
use crate::metrics::MetricsWriter;
use crate::server::health::{
    health_check_handler, readiness_handler, HealthCheckState, ReadinessFlag,
};
use crate::server::metatile::{metatile_handler, MetatileRouteState};
use crate::server::parse::{MetatileParser, TileJsonParser};
use crate::server::pattern::RoutePattern;
use crate::server::preview::{preview_handler, PreviewPage};
use crate::server::tilejson::{tilejson_handler, TileJsonRouteState};
use crate::storage::{FileStorage, S3Storage, Storage};

/// Shared pieces every route draws on.
pub struct GatewayComponents {
    /// Present when any storage definition is s3-backed
    pub s3_client: Option<aws_sdk_s3::Client>,
    pub cache: Arc<dyn Cache>,
    pub buffers: Arc<dyn BufferManager>,
    pub metrics: Arc<dyn MetricsWriter>,
}

/// Build the complete router. Performs a best-effort health probe of each
/// distinct storage at startup, logging failures without refusing to start.
pub async fn build_router(
    operator: &Config,
    config: &HandlerConfig,
    components: GatewayComponents,
    readiness: ReadinessFlag,
) -> Result<Router, String> {
    let mut router = Router::new();

    // one storage per distinct (type, sentinel) pair gets health-checked
    let mut health_checked: HashMap<(String, String), Arc<dyn Storage>> = HashMap::new();

    for (pattern, route_config) in &config.pattern {
        let definition = config
            .storage
            .get(&route_config.storage)
            .ok_or_else(|| format!("unknown storage definition: {}", route_config.storage))?;
        let resolved = ResolvedRoute::new(pattern, route_config, definition);

        let storage = create_storage(&resolved, &components)?;

        if !resolved.healthcheck.is_empty() {
            if let Err(err) = storage.health_check().await {
                warn!(category = "config", "healthcheck failed on storage: {}", err);
            }
            health_checked
                .entry((resolved.storage_type.clone(), resolved.healthcheck.clone()))
                .or_insert_with(|| Arc::clone(&storage));
        }

        let route_pattern = Arc::new(
            RoutePattern::parse(pattern)
                .map_err(|e| format!("bad pattern {}: {}", pattern, e))?,
        );

        if resolved.is_metatile() {
            let state = MetatileRouteState {
                parser: Arc::new(MetatileParser::new(config.mime.clone())),
                pattern: Arc::clone(&route_pattern),
                storage,
                cache: Arc::clone(&components.cache),
                buffers: Arc::clone(&components.buffers),
                metrics: Arc::clone(&components.metrics),
                metatile_size: resolved.metatile_size,
                tile_size: resolved.tile_size,
                max_detail_zoom: resolved.max_detail_zoom,
            };
            router = router.merge(
                Router::new()
                    .route(route_pattern.route_path(), get(metatile_handler))
                    .with_state(state),
            );
        } else {
            let state = TileJsonRouteState {
                parser: Arc::new(TileJsonParser),
                pattern: Arc::clone(&route_pattern),
                storage,
                metrics: Arc::clone(&components.metrics),
            };
            router = router.merge(
                Router::new()
                    .route(route_pattern.route_path(), get(tilejson_handler))
                    .with_state(state),
            );
        }
    }

    if let Some(preview) = &config.preview {
        let empty = HashMap::new();
        let data = preview.data.as_ref().unwrap_or(&empty);
        let page = PreviewPage::load(&preview.template, data)
            .await
            .map_err(|e| format!("couldn't load preview template: {}", e))?;
        router = router.merge(
            Router::new()
                .route(preview.path.as_str(), get(preview_handler))
                .with_state(page),
        );
    }

    if let Some(path) = operator.healthcheck.as_deref().filter(|p| !p.is_empty()) {
        let state = HealthCheckState {
            storages: Arc::new(health_checked.into_values().collect()),
        };
        router = router.merge(
            Router::new()
                .route(path, get(health_check_handler))
                .with_state(state),
        );
    }

    if let Some(path) = operator.readycheck.as_deref().filter(|p| !p.is_empty()) {
        router = router.merge(
            Router::new()
                .route(path, get(readiness_handler))
                .with_state(readiness),
        );
    }

    Ok(router
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive()))
}

fn create_storage(
    resolved: &ResolvedRoute,
    components: &GatewayComponents,
) -> Result<Arc<dyn Storage>, String> {
    match resolved.storage_type.as_str() {
        "s3" => {
            let client = components
                .s3_client
                .clone()
                .ok_or_else(|| "s3 storage configured but no s3 client available".to_string())?;
            Ok(Arc::new(S3Storage::new(
                client,
                resolved.bucket.clone(),
                resolved.key_pattern.clone(),
                resolved.default_prefix.clone(),
                resolved.layer.clone(),
                resolved.healthcheck.clone(),
            )))
        }
        "file" => Ok(Arc::new(FileStorage::new(
            resolved.base_dir.clone(),
            resolved.layer.clone(),
            resolved.healthcheck.clone(),
        ))),
        other => Err(format!("unknown storage type: {}", other)),
    }
}
