//! Configuration for the metatile gateway.
//!
//! Two layers, like the original deployment surface:
//!
//! - operator flags via clap (with `GATEWAY_`-prefixed environment
//!   fallbacks): listen address, probe paths, buffer pool sizing, statsd
//!   address/prefix, redis address and the handler-config location;
//! - a JSON *handler config* describing storages, URL patterns, the MIME
//!   map and the optional preview page.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::tile::is_power_of_two;

/// Default interface and port to listen on.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

// =============================================================================
// Operator flags
// =============================================================================

/// Metatile gateway - serves individual map tiles out of ZIP metatiles.
///
/// Tiles are extracted from metatile archives fetched from S3 or local disk
/// and streamed to clients with their HTTP cache metadata intact.
#[derive(Parser, Debug, Clone)]
#[command(name = "metatile-gateway")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Interface and port to listen on.
    #[arg(long, default_value = DEFAULT_LISTEN, env = "GATEWAY_LISTEN")]
    pub listen: String,

    /// URL path for the load-balancer health check.
    #[arg(long, env = "GATEWAY_HEALTHCHECK")]
    pub healthcheck: Option<String>,

    /// URL path for the readiness check (for Kubernetes readinessProbe).
    #[arg(long, env = "GATEWAY_READYCHECK")]
    pub readycheck: Option<String>,

    /// Number of buffers to pool. Zero disables pooling.
    #[arg(long, default_value_t = 0, env = "GATEWAY_POOLNUMENTRIES")]
    pub poolnumentries: usize,

    /// Size of each pooled buffer in bytes.
    #[arg(long, default_value_t = 0, env = "GATEWAY_POOLENTRYSIZE")]
    pub poolentrysize: usize,

    /// host:port to send statsd metrics to.
    #[arg(long = "metrics-statsd-addr", env = "GATEWAY_METRICS_STATSD_ADDR")]
    pub metrics_statsd_addr: Option<String>,

    /// Prefix prepended to every metric name.
    #[arg(
        long = "metrics-statsd-prefix",
        default_value = "",
        env = "GATEWAY_METRICS_STATSD_PREFIX"
    )]
    pub metrics_statsd_prefix: String,

    /// Redis connection address for the tile cache (e.g.
    /// redis://127.0.0.1:6379).
    #[arg(long = "redis-addr", env = "GATEWAY_REDIS_ADDR")]
    pub redis_addr: Option<String>,

    /// Path to the JSON handler config file.
    #[arg(long, env = "GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Inline JSON handler config; takes precedence over --config.
    #[arg(long, env = "GATEWAY_HANDLER")]
    pub handler: Option<String>,
}

impl Config {
    /// Load the handler config from the inline flag or the config file.
    pub fn load_handler_config(&self) -> Result<HandlerConfig, String> {
        let raw = if let Some(inline) = &self.handler {
            inline.clone()
        } else if let Some(path) = &self.config {
            std::fs::read_to_string(path)
                .map_err(|e| format!("unable to read config file {}: {}", path.display(), e))?
        } else {
            return Err(
                "no handler configuration: provide --handler or --config".to_string()
            );
        };

        let config: HandlerConfig = serde_json::from_str(&raw)
            .map_err(|e| format!("unable to parse handler config as JSON: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Handler config (JSON)
// =============================================================================

/// AWS-wide options shared by every S3 storage.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AwsConfig {
    /// AWS region requests come from
    pub region: Option<String>,
    /// IAM role to assume for S3 requests
    pub role: Option<String>,
}

/// Base options for one named storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StorageDefinition {
    /// "s3" or "file"
    pub r#type: String,

    /// Number of 256px tiles per metatile dimension
    #[serde(default)]
    pub metatile_size: Option<u32>,

    /// Deepest zoom the metatiles were materialized at; 0/absent disables
    /// the clamp
    #[serde(default)]
    pub metatile_max_detail_zoom: Option<i32>,

    /// Size of the extracted tile in 256px units; defaults to 1
    #[serde(default)]
    pub tile_size: Option<u32>,

    /// S3 key or file path probed by the health check
    #[serde(default)]
    pub healthcheck: String,

    // s3 fields
    #[serde(default)]
    pub layer: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key_pattern: String,

    // file fields
    #[serde(default)]
    pub base_dir: String,
}

/// Per-pattern configuration, overriding its storage definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteConfig {
    /// Name of the storage definition to use
    pub storage: String,

    /// "metatile" (default) or "tilejson"
    #[serde(default)]
    pub r#type: Option<String>,

    #[serde(default)]
    pub metatile_size: Option<u32>,
    #[serde(default)]
    pub tile_size: Option<u32>,

    /// Default storage key prefix; required for s3 metatile patterns
    #[serde(default)]
    pub default_prefix: Option<String>,
    #[serde(default)]
    pub key_pattern: Option<String>,
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default)]
    pub base_dir: Option<String>,
}

/// The preview webpage; both path and template are required when present.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PreviewConfig {
    /// HTTP path to serve the page at
    pub path: String,
    /// On-disk template path
    pub template: PathBuf,
    /// Values substituted into the template
    #[serde(default)]
    pub data: Option<HashMap<String, serde_json::Value>>,
}

/// The JSON object recognized by the handler flag.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandlerConfig {
    pub aws: Option<AwsConfig>,
    #[serde(default)]
    pub storage: HashMap<String, StorageDefinition>,
    #[serde(default)]
    pub pattern: HashMap<String, RouteConfig>,
    #[serde(default)]
    pub mime: HashMap<String, String>,
    pub preview: Option<PreviewConfig>,
}

impl HandlerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.pattern.is_empty() {
            return Err("you must provide at least one pattern".to_string());
        }
        if self.storage.is_empty() {
            return Err("you must provide at least one storage".to_string());
        }

        for (name, definition) in &self.storage {
            match definition.r#type.as_str() {
                "s3" => {
                    if definition.bucket.is_empty() {
                        return Err(format!("s3 storage {} missing bucket", name));
                    }
                }
                "file" => {
                    if definition.base_dir.is_empty() {
                        return Err(format!("file storage {} missing base dir", name));
                    }
                }
                other => {
                    return Err(format!("unknown storage type for storage {}: {}", name, other));
                }
            }
        }

        for (pattern, route) in &self.pattern {
            let definition = self.storage.get(&route.storage).ok_or_else(|| {
                format!(
                    "pattern {} references unknown storage definition {}",
                    pattern, route.storage
                )
            })?;

            if let Some(kind) = &route.r#type {
                if kind != "metatile" && kind != "tilejson" {
                    return Err(format!("invalid route handler type: {}", kind));
                }
            }

            let resolved = ResolvedRoute::new(pattern, route, definition);
            if resolved.is_metatile() {
                if !is_power_of_two(resolved.metatile_size) {
                    return Err(format!(
                        "metatile size must be power of two, but {} is not",
                        resolved.metatile_size
                    ));
                }
                if !is_power_of_two(resolved.tile_size) {
                    return Err(format!(
                        "tile size must be power of two, but {} is not",
                        resolved.tile_size
                    ));
                }
                if definition.r#type == "s3" && route.default_prefix.is_none() {
                    return Err(format!(
                        "s3 pattern {} requires DefaultPrefix",
                        pattern
                    ));
                }
                if definition.r#type == "s3" && resolved.key_pattern.is_empty() {
                    return Err(format!("s3 pattern {} missing key pattern", pattern));
                }
            }
        }

        Ok(())
    }
}

/// A pattern's effective settings after applying its overrides to the
/// storage definition.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub pattern: String,
    pub storage_type: String,
    pub route_type: String,
    pub metatile_size: u32,
    pub tile_size: u32,
    pub max_detail_zoom: i32,
    pub layer: String,
    pub bucket: String,
    pub key_pattern: String,
    pub default_prefix: String,
    pub base_dir: String,
    pub healthcheck: String,
}

impl ResolvedRoute {
    pub fn new(pattern: &str, route: &RouteConfig, definition: &StorageDefinition) -> Self {
        Self {
            pattern: pattern.to_string(),
            storage_type: definition.r#type.clone(),
            route_type: route
                .r#type
                .clone()
                .unwrap_or_else(|| "metatile".to_string()),
            metatile_size: route
                .metatile_size
                .or(definition.metatile_size)
                .unwrap_or(1),
            tile_size: route.tile_size.or(definition.tile_size).unwrap_or(1),
            max_detail_zoom: definition.metatile_max_detail_zoom.unwrap_or(0),
            layer: route
                .layer
                .clone()
                .unwrap_or_else(|| definition.layer.clone()),
            bucket: definition.bucket.clone(),
            key_pattern: route
                .key_pattern
                .clone()
                .unwrap_or_else(|| definition.key_pattern.clone()),
            default_prefix: route.default_prefix.clone().unwrap_or_default(),
            base_dir: route
                .base_dir
                .clone()
                .unwrap_or_else(|| definition.base_dir.clone()),
            healthcheck: definition.healthcheck.clone(),
        }
    }

    pub fn is_metatile(&self) -> bool {
        self.route_type == "metatile"
    }
}
