//! Switchboard gateway.
//!
//! Wires the session registry, the dispatch channels and the command worker
//! pool together, restores persisted sessions, and serves the HTTP surface
//! until a shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use switchboard_api::{create_router, serve, shutdown_signal, AppState, Config, LogFormat};
use switchboard_coord::{
    Deduplicator, DistributedLock, MemoryCache, RateLimiter, RedisCache, SharedCache,
};
use switchboard_core::{Clock, EventSink, FileStore, MulticastSink, RealClock};
use switchboard_delivery::WebhookDispatcher;
use switchboard_queue::{
    CommandPublisher, HandlerRegistry, MemoryBroker, QueueTransport, RedisBroker, WorkerPool,
};
use switchboard_realtime::Hub;
use switchboard_sessions::{BridgeTransportFactory, SessionRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    info!(
        addr = %format!("{}:{}", config.host, config.port),
        tenants_file = %config.tenants_file.display(),
        redis_url = config.redis_url_masked().as_deref().unwrap_or("<in-memory>"),
        bridge_url = %config.bridge_url,
        "Starting switchboard gateway"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let cache = connect_cache(&config, &clock).await?;

    let store = Arc::new(
        FileStore::open(&config.tenants_file).await.context("Failed to open tenants file")?,
    );

    let sse_hub = Hub::start("sse", config.to_hub_config());
    let ws_hub = Hub::start("ws", config.to_hub_config());
    let webhooks = Arc::new(
        WebhookDispatcher::start(
            config.to_dispatcher_config(),
            store.clone(),
            store.clone(),
            clock.clone(),
        )
        .context("Failed to start webhook dispatcher")?,
    );

    let sink: Arc<dyn EventSink> = Arc::new(
        MulticastSink::new()
            .with_sink(webhooks.clone())
            .with_sink(Arc::new(sse_hub.clone()))
            .with_sink(Arc::new(ws_hub.clone())),
    );

    let factory = BridgeTransportFactory::new(config.to_bridge_config())
        .context("Failed to create bridge transport")?;
    let sessions = Arc::new(
        SessionRegistry::new(Arc::new(factory), sink, store.clone(), clock.clone())
            .with_config(config.to_registry_config())
            .with_restore_lock(DistributedLock::new(cache.clone())),
    );

    match sessions.restore_all(store.as_ref()).await {
        Ok(report) => info!(
            restored = report.restored,
            reconnected = report.reconnected,
            skipped = report.skipped,
            failed = report.failed,
            "sessions restored"
        ),
        Err(e) => error!(error = %e, "failed to restore sessions"),
    }

    let broker = connect_broker(&config).await?;
    let commands = CommandPublisher::new(broker.clone(), config.command_queue.clone());
    let workers = WorkerPool::new(
        config.to_worker_config(),
        broker,
        HandlerRegistry::for_sessions(sessions.clone()),
        clock.clone(),
    )
    .with_deduplicator(Deduplicator::new(cache.clone(), config.dedup_ttl()))
    .with_rate_limiter(RateLimiter::new(cache, clock.clone(), config.to_rate_limit_config()));
    workers.start().await.context("Failed to start command workers")?;

    let state = AppState {
        sessions: sessions.clone(),
        sse_hub: sse_hub.clone(),
        ws_hub: ws_hub.clone(),
        commands,
        webhooks: webhooks.clone(),
        clock,
    };
    let router = create_router(state, config.request_timeout());
    let listener = tokio::net::TcpListener::bind(config.parse_server_addr()?)
        .await
        .context("Failed to bind HTTP listener")?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { serve(listener, router, async move { shutdown.cancelled().await }).await }
    });

    info!("switchboard is ready");
    shutdown_signal().await;
    shutdown.cancel();

    // Realtime streams never end on their own; closing the hubs lets the
    // server's graceful shutdown finish.
    sse_hub.shutdown();
    ws_hub.shutdown();

    let timeout = config.shutdown_timeout();
    if let Err(e) = workers.stop(timeout).await {
        warn!(error = %e, "command workers did not stop cleanly");
    }
    if let Err(e) = webhooks.shutdown(timeout).await {
        warn!(error = %e, "webhook dispatcher did not stop cleanly");
    }
    sessions.shutdown().await;

    match tokio::time::timeout(timeout, server).await {
        Ok(Ok(Ok(()))) => {},
        Ok(Ok(Err(e))) => error!(error = %e, "HTTP server failed"),
        Ok(Err(e)) => error!(error = %e, "HTTP server task panicked"),
        Err(_) => warn!("HTTP server did not stop within the shutdown timeout"),
    }

    info!("switchboard shutdown complete");
    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(true)).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
    }
    .context("Failed to install tracing subscriber")
}

/// Redis when configured, otherwise a process-local cache.
async fn connect_cache(config: &Config, clock: &Arc<dyn Clock>) -> Result<Arc<dyn SharedCache>> {
    match &config.redis_url {
        Some(url) => {
            let cache = RedisCache::connect(url).await.context("Failed to connect to Redis")?;
            Ok(Arc::new(cache))
        },
        None => {
            info!("no redis_url configured, coordination is process-local");
            Ok(Arc::new(MemoryCache::with_clock(clock.clone())))
        },
    }
}

/// Redis streams when configured, otherwise bounded in-process queues.
async fn connect_broker(config: &Config) -> Result<Arc<dyn QueueTransport>> {
    match &config.redis_url {
        Some(url) => {
            let broker = RedisBroker::connect(url, config.to_broker_config())
                .await
                .context("Failed to connect the command queue to Redis")?;
            Ok(Arc::new(broker))
        },
        None => {
            info!(max_len = config.queue_max_len, "no redis_url configured, command queues are process-local");
            Ok(Arc::new(MemoryBroker::with_max_len(config.queue_max_len)))
        },
    }
}
