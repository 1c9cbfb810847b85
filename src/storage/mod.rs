//! Persistence: storage contract, MySQL driver, batched write coalescer
//! and the retention cleaner.

pub mod batch_writer;
pub mod cleaner;
pub mod mysql;

pub use batch_writer::{BatchItem, BatchWriter, BatchWriterConfig, QueueFull};
pub use cleaner::DataCleaner;
pub use mysql::MySqlStorage;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{OrderAggregationRow, PositionRecord, Signal};

/// The storage contract the pipeline depends on. The watch table is owned
/// by another service; everything else is ours.
#[async_trait]
pub trait MonitorStorage: Send + Sync {
    /// Distinct addresses currently enabled in the watch table.
    async fn list_active_addresses(&self) -> Result<Vec<String>>;

    /// Aggregations with `signal_sent` whose last fill falls after `since`
    /// (dedup warm-up).
    async fn get_sent_orders_since(&self, since: DateTime<Utc>) -> Result<Vec<OrderAggregationRow>>;

    /// Upsert by unique (address, order_id, direction).
    async fn batch_upsert_order_aggregations(&self, rows: &[OrderAggregationRow]) -> Result<()>;

    /// Upsert by unique (address).
    async fn batch_upsert_position_cache(&self, rows: &[PositionRecord]) -> Result<()>;

    async fn create_signal(&self, signal: &Signal) -> Result<()>;

    /// Returns the number of rows deleted.
    async fn delete_aggregations_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Returns the number of rows deleted.
    async fn delete_signals_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
