//! Coalescing upsert buffer
//!
//! Items land on a bounded intake channel and drain into a map keyed by
//! their dedup key, so rapid rewrites of the same row collapse into the
//! last writer. Flushes fire on size or interval, grouped by table. A
//! failed flush drops that flush's write; the next state-changing event
//! re-buffers the row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::MonitorStorage;
use crate::models::{OrderAggregationRow, PositionRecord};

#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_queue_size: usize,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(2),
            max_queue_size: 10_000,
        }
    }
}

/// Anything the writer knows how to upsert.
#[derive(Debug, Clone)]
pub enum BatchItem {
    OrderAggregation(OrderAggregationRow),
    PositionCache(PositionRecord),
}

impl BatchItem {
    /// Stable coalescing key; later writes with the same key win.
    pub fn dedup_key(&self) -> String {
        match self {
            BatchItem::OrderAggregation(row) => {
                format!("oa:{}:{}:{}", row.order_id, row.address, row.direction)
            }
            BatchItem::PositionCache(row) => format!("pc:{}", row.address),
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            BatchItem::OrderAggregation(_) => "order_aggregations",
            BatchItem::PositionCache(_) => "position_cache",
        }
    }
}

/// Returned by `add` when the intake channel is saturated or stopped.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

impl std::fmt::Display for QueueFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("batch writer queue full")
    }
}

impl std::error::Error for QueueFull {}

enum WriterCmd {
    Item(BatchItem),
    Stop(oneshot::Sender<()>),
}

#[derive(Default)]
struct WriterMetrics {
    accepted: AtomicU64,
    rejected: AtomicU64,
    flushed_rows: AtomicU64,
    flush_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchWriterStats {
    pub accepted: u64,
    pub rejected: u64,
    pub flushed_rows: u64,
    pub flush_errors: u64,
}

pub struct BatchWriter {
    tx: mpsc::Sender<WriterCmd>,
    metrics: Arc<WriterMetrics>,
}

impl BatchWriter {
    pub fn spawn(config: BatchWriterConfig, storage: Arc<dyn MonitorStorage>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.max_queue_size);
        let metrics = Arc::new(WriterMetrics::default());
        let task_metrics = metrics.clone();
        tokio::spawn(async move {
            run(rx, config, storage, task_metrics).await;
        });
        Arc::new(Self { tx, metrics })
    }

    /// Non-blocking; a saturated intake is the caller's problem.
    pub fn add(&self, item: BatchItem) -> Result<(), QueueFull> {
        match self.tx.try_send(WriterCmd::Item(item)) {
            Ok(()) => {
                self.metrics.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("batch_writer_rejected_total", 1);
                Err(QueueFull)
            }
        }
    }

    /// Close the intake, drain in-flight items and flush once more.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterCmd::Stop(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// `stop` with a deadline; returns false if the deadline expired.
    pub async fn graceful_shutdown(&self, deadline: Duration) -> bool {
        tokio::time::timeout(deadline, self.stop()).await.is_ok()
    }

    pub fn stats(&self) -> BatchWriterStats {
        BatchWriterStats {
            accepted: self.metrics.accepted.load(Ordering::Relaxed),
            rejected: self.metrics.rejected.load(Ordering::Relaxed),
            flushed_rows: self.metrics.flushed_rows.load(Ordering::Relaxed),
            flush_errors: self.metrics.flush_errors.load(Ordering::Relaxed),
        }
    }
}

async fn run(
    mut rx: mpsc::Receiver<WriterCmd>,
    config: BatchWriterConfig,
    storage: Arc<dyn MonitorStorage>,
    metrics: Arc<WriterMetrics>,
) {
    let mut buffer: HashMap<String, BatchItem> = HashMap::new();
    let mut ticker = interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // interval fires immediately once; the first flush should wait a full period
    ticker.tick().await;

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(WriterCmd::Item(item)) => {
                    buffer.insert(item.dedup_key(), item);
                    if buffer.len() >= config.batch_size {
                        flush(&mut buffer, storage.as_ref(), &metrics).await;
                    }
                }
                Some(WriterCmd::Stop(ack)) => {
                    // drain whatever is still in flight, then one last flush
                    while let Ok(WriterCmd::Item(item)) = rx.try_recv() {
                        buffer.insert(item.dedup_key(), item);
                    }
                    flush(&mut buffer, storage.as_ref(), &metrics).await;
                    let _ = ack.send(());
                    info!("Batch writer stopped");
                    return;
                }
                None => {
                    flush(&mut buffer, storage.as_ref(), &metrics).await;
                    return;
                }
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&mut buffer, storage.as_ref(), &metrics).await;
                }
            }
        }
    }
}

async fn flush(
    buffer: &mut HashMap<String, BatchItem>,
    storage: &dyn MonitorStorage,
    metrics: &WriterMetrics,
) {
    if buffer.is_empty() {
        return;
    }

    let mut orders = Vec::new();
    let mut positions = Vec::new();
    for (_, item) in buffer.drain() {
        match item {
            BatchItem::OrderAggregation(row) => orders.push(row),
            BatchItem::PositionCache(row) => positions.push(row),
        }
    }

    if !orders.is_empty() {
        match storage.batch_upsert_order_aggregations(&orders).await {
            Ok(()) => {
                metrics
                    .flushed_rows
                    .fetch_add(orders.len() as u64, Ordering::Relaxed);
                debug!(rows = orders.len(), "Flushed order aggregations");
            }
            Err(e) => {
                metrics.flush_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, rows = orders.len(), "Order aggregation flush failed, dropping batch");
            }
        }
    }

    if !positions.is_empty() {
        match storage.batch_upsert_position_cache(&positions).await {
            Ok(()) => {
                metrics
                    .flushed_rows
                    .fetch_add(positions.len() as u64, Ordering::Relaxed);
                debug!(rows = positions.len(), "Flushed position cache rows");
            }
            Err(e) => {
                metrics.flush_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, rows = positions.len(), "Position cache flush failed, dropping batch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;

    use crate::models::Signal;

    #[derive(Default)]
    struct RecordingStorage {
        order_batches: Mutex<Vec<Vec<OrderAggregationRow>>>,
        position_batches: Mutex<Vec<Vec<PositionRecord>>>,
    }

    #[async_trait]
    impl MonitorStorage for RecordingStorage {
        async fn list_active_addresses(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn get_sent_orders_since(
            &self,
            _since: DateTime<Utc>,
        ) -> Result<Vec<OrderAggregationRow>> {
            Ok(Vec::new())
        }
        async fn batch_upsert_order_aggregations(
            &self,
            rows: &[OrderAggregationRow],
        ) -> Result<()> {
            self.order_batches.lock().push(rows.to_vec());
            Ok(())
        }
        async fn batch_upsert_position_cache(&self, rows: &[PositionRecord]) -> Result<()> {
            self.position_batches.lock().push(rows.to_vec());
            Ok(())
        }
        async fn create_signal(&self, _signal: &Signal) -> Result<()> {
            Ok(())
        }
        async fn delete_aggregations_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
        async fn delete_signals_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
    }

    fn order_row(address: &str, oid: u64, total_size: f64) -> OrderAggregationRow {
        OrderAggregationRow {
            address: address.to_string(),
            order_id: oid,
            direction: "Open Long".to_string(),
            symbol: "ETH".to_string(),
            total_size,
            avg_price: 100.0,
            fill_count: 1,
            order_status: "open".to_string(),
            signal_sent: false,
            first_fill_time: 1,
            last_fill_time: 1,
            fills_json: "[]".to_string(),
        }
    }

    #[test]
    fn test_dedup_keys() {
        let oa = BatchItem::OrderAggregation(order_row("0xaa", 7, 1.0));
        assert_eq!(oa.dedup_key(), "oa:7:0xaa:Open Long");
        let pc = BatchItem::PositionCache(PositionRecord {
            address: "0xaa".to_string(),
            ..Default::default()
        });
        assert_eq!(pc.dedup_key(), "pc:0xaa");
    }

    #[tokio::test]
    async fn test_same_key_coalesces_to_last_writer() {
        let storage = Arc::new(RecordingStorage::default());
        let writer = BatchWriter::spawn(
            BatchWriterConfig {
                batch_size: 100,
                flush_interval: Duration::from_secs(3600),
                max_queue_size: 16,
            },
            storage.clone(),
        );

        writer
            .add(BatchItem::OrderAggregation(order_row("0xaa", 7, 1.0)))
            .unwrap();
        writer
            .add(BatchItem::OrderAggregation(order_row("0xaa", 7, 2.0)))
            .unwrap();
        writer.stop().await;

        let batches = storage.order_batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        // the second payload won
        assert_eq!(batches[0][0].total_size, 2.0);
    }

    #[tokio::test]
    async fn test_size_triggered_flush() {
        let storage = Arc::new(RecordingStorage::default());
        let writer = BatchWriter::spawn(
            BatchWriterConfig {
                batch_size: 2,
                flush_interval: Duration::from_secs(3600),
                max_queue_size: 16,
            },
            storage.clone(),
        );

        writer
            .add(BatchItem::OrderAggregation(order_row("0xaa", 1, 1.0)))
            .unwrap();
        writer
            .add(BatchItem::OrderAggregation(order_row("0xaa", 2, 1.0)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(storage.order_batches.lock().len(), 1);
        assert_eq!(writer.stats().flushed_rows, 2);
    }

    #[tokio::test]
    async fn test_stop_drains_in_flight_items() {
        let storage = Arc::new(RecordingStorage::default());
        let writer = BatchWriter::spawn(
            BatchWriterConfig {
                batch_size: 1000,
                flush_interval: Duration::from_secs(3600),
                max_queue_size: 64,
            },
            storage.clone(),
        );

        for oid in 0..10u64 {
            writer
                .add(BatchItem::OrderAggregation(order_row("0xaa", oid, 1.0)))
                .unwrap();
        }
        assert!(writer.graceful_shutdown(Duration::from_secs(5)).await);

        let total: usize = storage.order_batches.lock().iter().map(Vec::len).sum();
        assert_eq!(total, 10);
    }
}
