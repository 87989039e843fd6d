//! Metatile gateway server binary.
//!
//! Wires the configured storages, cache, buffer pool and metrics writer
//! into the router and serves it, with readiness-aware graceful shutdown.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metatile_gateway::buffer::{BufferManager, OnDemandBufferManager, PooledBufferManager};
use metatile_gateway::cache::{Cache, NullCache, RedisCache};
use metatile_gateway::config::Config;
use metatile_gateway::metrics::{MetricsWriter, NilMetricsWriter, StatsdMetricsWriter};
use metatile_gateway::server::{build_router, GatewayComponents, ReadinessFlag};
use metatile_gateway::storage::create_s3_client;

/// Time to keep answering /ready with 500 before connections start draining,
/// so upstream load balancers stop routing here first.
const GRACEFUL_SHUTDOWN_SLEEP: Duration = Duration::from_secs(20);

/// Time allowed for in-flight requests after draining begins.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let config = Config::parse();

    init_logging();

    let handler_config = match config.load_handler_config() {
        Ok(handler_config) => handler_config,
        Err(err) => {
            error!(category = "config", "{}", err);
            std::process::exit(1);
        }
    };

    // buffer manager shared by all handlers
    let buffers: Arc<dyn BufferManager> = if config.poolnumentries > 0 && config.poolentrysize > 0
    {
        info!(
            "buffer pool: {} entries of {} bytes",
            config.poolnumentries, config.poolentrysize
        );
        Arc::new(PooledBufferManager::new(
            config.poolnumentries,
            config.poolentrysize,
        ))
    } else {
        Arc::new(OnDemandBufferManager)
    };

    let cache: Arc<dyn Cache> = match &config.redis_addr {
        Some(addr) => match RedisCache::connect(addr).await {
            Ok(cache) => {
                info!("redis connected to {}", addr);
                Arc::new(cache)
            }
            Err(err) => {
                error!(
                    category = "config",
                    "couldn't reach redis service at {}: {}", addr, err
                );
                std::process::exit(1);
            }
        },
        None => Arc::new(NullCache),
    };

    let metrics: Arc<dyn MetricsWriter> = match &config.metrics_statsd_addr {
        Some(addr) => {
            let resolved = addr
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next());
            match resolved {
                Some(resolved) => Arc::new(StatsdMetricsWriter::new(
                    resolved,
                    config.metrics_statsd_prefix.clone(),
                )),
                None => {
                    error!(category = "config", "invalid statsd address {}", addr);
                    std::process::exit(1);
                }
            }
        }
        None => Arc::new(NilMetricsWriter),
    };

    // one s3 client shared by every s3 storage
    let needs_s3 = handler_config
        .storage
        .values()
        .any(|definition| definition.r#type == "s3");
    let s3_client = if needs_s3 {
        let aws = handler_config.aws.clone().unwrap_or_default();
        Some(create_s3_client(aws.region.as_deref(), aws.role.as_deref()).await)
    } else {
        None
    };

    let readiness = ReadinessFlag::new();
    let components = GatewayComponents {
        s3_client,
        cache,
        buffers,
        metrics,
    };

    let router = match build_router(&config, &handler_config, components, readiness.clone()).await
    {
        Ok(router) => router,
        Err(err) => {
            error!(category = "config", "{}", err);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&config.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind to {}: {}", config.listen, err);
            std::process::exit(1);
        }
    };
    info!("server started and listening on {}", config.listen);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("termination signal received, starting graceful shutdown");

        // fail readiness probes first so load balancers drain this instance
        readiness.start_draining();
        tokio::time::sleep(GRACEFUL_SHUTDOWN_SLEEP).await;
        let _ = shutdown_tx.send(());

        tokio::time::sleep(GRACEFUL_SHUTDOWN_TIMEOUT).await;
        warn!("graceful shutdown deadline reached, exiting");
        std::process::exit(0);
    });

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    if let Err(err) = server.await {
        error!("server error: {}", err);
        std::process::exit(1);
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "metatile_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!("failed to install SIGTERM handler: {}", err);
            std::future::pending::<()>().await;
            unreachable!();
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
