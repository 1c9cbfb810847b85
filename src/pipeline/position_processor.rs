//! Position snapshot processor
//!
//! The in-memory balance cache is updated by the subscription side before
//! the message is enqueued; this half only forwards the durable row to the
//! batch writer.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::warn;

use super::queue::{MessageHandler, MonitorMessage};
use crate::storage::{BatchItem, BatchWriter};

pub struct PositionProcessor {
    batch_writer: Arc<BatchWriter>,
}

impl PositionProcessor {
    pub fn new(batch_writer: Arc<BatchWriter>) -> Self {
        Self { batch_writer }
    }
}

impl MessageHandler for PositionProcessor {
    fn handle(&self, msg: MonitorMessage) -> anyhow::Result<()> {
        match msg {
            MonitorMessage::PositionSnapshot { address, record } => self
                .batch_writer
                .add(BatchItem::PositionCache(record))
                .map_err(|e| anyhow!("position cache write for {address} rejected: {e}")),
            other => {
                warn!(?other, "Order message routed to position processor, dropped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionRecord;
    use crate::storage::BatchWriterConfig;
    use crate::storage::MonitorStorage;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingStorage {
        positions: Mutex<Vec<PositionRecord>>,
    }

    #[async_trait]
    impl MonitorStorage for RecordingStorage {
        async fn list_active_addresses(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn get_sent_orders_since(
            &self,
            _since: DateTime<Utc>,
        ) -> Result<Vec<crate::models::OrderAggregationRow>> {
            Ok(Vec::new())
        }
        async fn batch_upsert_order_aggregations(
            &self,
            _rows: &[crate::models::OrderAggregationRow],
        ) -> Result<()> {
            Ok(())
        }
        async fn batch_upsert_position_cache(&self, rows: &[PositionRecord]) -> Result<()> {
            self.positions.lock().extend(rows.iter().cloned());
            Ok(())
        }
        async fn create_signal(&self, _signal: &crate::models::Signal) -> Result<()> {
            Ok(())
        }
        async fn delete_aggregations_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
        async fn delete_signals_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_snapshot_forwarded_to_batch_writer() {
        let storage = Arc::new(RecordingStorage::default());
        let writer = BatchWriter::spawn(BatchWriterConfig::default(), storage.clone());
        let processor = PositionProcessor::new(writer.clone());

        processor
            .handle(MonitorMessage::PositionSnapshot {
                address: "0xaa".to_string(),
                record: PositionRecord {
                    address: "0xaa".to_string(),
                    spot_total_usd: 10.0,
                    account_value: 20.0,
                    ..Default::default()
                },
            })
            .unwrap();

        assert!(writer.graceful_shutdown(Duration::from_secs(5)).await);
        let rows = storage.positions.lock();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].account_value, 20.0);
    }
}
