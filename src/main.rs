//! hl-monitor entrypoint: config, wiring and ordered shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hl_monitor::bus::{NatsPublisher, SignalPublisher};
use hl_monitor::caches::{PositionBalanceCache, PriceCache, SymbolCache, SymbolLoader};
use hl_monitor::config::{Config, LogConfig};
use hl_monitor::health::{self, HealthState};
use hl_monitor::monitor::{AddressLoader, OrderSubscriptionManager, PositionManager};
use hl_monitor::pipeline::queue::{ORDER_QUEUE_CAPACITY, POSITION_QUEUE_CAPACITY};
use hl_monitor::pipeline::{DedupCache, MessageHandler, MessageQueue, OrderProcessor, PositionProcessor};
use hl_monitor::storage::{
    BatchWriter, BatchWriterConfig, DataCleaner, MonitorStorage, MySqlStorage,
};
use hl_monitor::telemetry;
use hl_monitor::ws::dispatcher::DEFAULT_WORKERS;
use hl_monitor::ws::pool::{PoolConfig, SubscriptionTable};
use hl_monitor::ws::{Dispatcher, PoolManager};

#[derive(Debug, Parser)]
#[command(name = "hl-monitor", about = "Hyperliquid trader address monitor")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "cfg.toml")]
    config: PathBuf,

    /// Validate the configuration and exit (reserved)
    #[arg(long)]
    test: bool,
}

fn init_logging(cfg: &LogConfig) {
    let filter =
        EnvFilter::try_new(&cfg.level).unwrap_or_else(|_| EnvFilter::new("info"));
    if cfg.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;
    init_logging(&cfg.log);

    if cli.test {
        info!(config = %cli.config.display(), "Configuration valid");
        return Ok(());
    }

    info!("Starting hl-monitor");
    let started_at = Instant::now();
    let prometheus = telemetry::init_prometheus()?;

    // Fatal startup dependencies: storage and symbol metadata.
    let mysql = Arc::new(
        MySqlStorage::connect(&cfg.mysql)
            .await
            .context("Storage init failed")?,
    );
    mysql.init_schema().await.context("Schema bootstrap failed")?;
    let storage: Arc<dyn MonitorStorage> = mysql.clone();

    let symbols = SymbolCache::new();
    let symbol_loader = SymbolLoader::new(&cfg.hl_monitor.hyperliquid_info_url, symbols.clone())?;
    symbol_loader
        .load()
        .await
        .context("Symbol metadata load failed")?;
    tokio::spawn(symbol_loader.run());

    let dedup = Arc::new(DedupCache::new());
    match dedup.warm_up(storage.as_ref()).await {
        Ok(marked) => info!(marked, "Dedup warm-up complete"),
        Err(e) => warn!(error = %e, "Dedup warm-up failed, continuing cold"),
    }

    let prices = Arc::new(PriceCache::new());
    let balances = Arc::new(PositionBalanceCache::new());

    let batch_writer = BatchWriter::spawn(BatchWriterConfig::default(), storage.clone());

    let publisher: Arc<dyn SignalPublisher> = Arc::new(
        NatsPublisher::connect(&cfg.nats)
            .await
            .context("NATS connect failed")?,
    );

    // WebSocket plumbing: shared subscription table, dispatcher, pool.
    let table: Arc<SubscriptionTable> = Arc::new(RwLock::new(HashMap::new()));
    let dispatcher = Dispatcher::new(table.clone(), DEFAULT_WORKERS);
    let pool = PoolManager::new(
        PoolConfig {
            ws_url: cfg.hl_monitor.hyperliquid_ws_url.clone(),
            max_connections: cfg.hl_monitor.max_connections,
            max_subscriptions_per_connection: cfg.hl_monitor.max_subscriptions_per_connection,
        },
        table,
        dispatcher.clone(),
    );
    pool.start().await.context("WebSocket pool start failed")?;

    // Processors behind their queues.
    let processor = OrderProcessor::spawn(
        cfg.order_aggregation.clone(),
        dedup.clone(),
        symbols.clone(),
        balances.clone(),
        batch_writer.clone(),
        publisher.clone(),
        storage.clone(),
    );
    let order_queue = MessageQueue::spawn(
        "orders",
        ORDER_QUEUE_CAPACITY,
        processor.clone() as Arc<dyn MessageHandler>,
    );
    let position_queue = MessageQueue::spawn(
        "positions",
        POSITION_QUEUE_CAPACITY,
        Arc::new(PositionProcessor::new(batch_writer.clone())),
    );

    // Address lifecycle.
    let order_sub = OrderSubscriptionManager::new(pool.clone(), order_queue, dedup.clone());
    let position_sub = PositionManager::new(
        pool.clone(),
        position_queue,
        prices,
        symbols.clone(),
        balances.clone(),
    );
    let loader = AddressLoader::new(
        storage.clone(),
        cfg.hl_monitor.reload_interval(),
        cfg.hl_monitor.remove_grace(),
    );
    loader.register(order_sub.clone());
    loader.register(position_sub.clone());
    if let Err(e) = loader.reconcile_now().await {
        warn!(error = %e, "Initial address sweep failed, retrying on schedule");
    }
    tokio::spawn(loader.clone().run());

    tokio::spawn(DataCleaner::new(storage.clone()).run());

    let health_state = HealthState {
        started_at,
        prometheus,
        pool: pool.clone(),
        dispatcher,
        publisher,
        processor,
        batch_writer: batch_writer.clone(),
        loader: loader.clone(),
        balances,
        symbols,
    };
    let health_addr = cfg.hl_monitor.health_server_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(&health_addr, health_state).await {
            error!(error = %e, "Health server failed");
        }
    });

    info!("hl-monitor running");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    // Ordered teardown: loader first so nothing new subscribes, then the
    // subscription managers, the pool, the writer (final flush), storage.
    loader.stop();
    order_sub.close().await;
    position_sub.close().await;
    pool.close().await;
    if !batch_writer.graceful_shutdown(Duration::from_secs(10)).await {
        warn!("Batch writer did not drain before the deadline");
    }
    mysql.close().await;

    info!("hl-monitor stopped");
    Ok(())
}
