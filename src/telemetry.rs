//! Prometheus recorder setup and metric descriptions.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn init_prometheus() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    describe_counter!("ws_decode_errors_total", "Inbound frames that failed to decode");
    describe_counter!("dispatcher_frames_total", "Frames routed to callbacks, by channel");
    describe_counter!(
        "dispatcher_overflow_sync_total",
        "Callbacks executed synchronously because the worker pool was saturated"
    );
    describe_counter!("pool_subscribes_total", "Server-side subscribes sent");
    describe_counter!("pool_unsubscribes_total", "Server-side unsubscribes sent");
    describe_counter!("pool_reconnects_total", "Completed pool repairs");
    describe_counter!("pool_migrations_total", "Subscriptions migrated to replacement connections");
    describe_counter!("order_fills_processed_total", "Fills appended to aggregations");
    describe_counter!("signals_published_total", "Signals published to the bus");
    describe_counter!("signal_publish_failures_total", "Bus publish failures");
    describe_counter!("position_snapshots_total", "Account snapshots processed");
    describe_counter!("queue_degraded_total", "Enqueues that ran the handler synchronously");
    describe_counter!("batch_writer_rejected_total", "Batch writer intake rejections");
    describe_gauge!("watched_addresses", "Addresses currently watched");

    Ok(handle)
}
