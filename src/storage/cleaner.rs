//! Retention cleaner: periodic range deletes
//!
//! Aggregations are kept for 2 hours past their last fill, signal rows for
//! 7 days. Delete failures are logged and retried on the next pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use super::MonitorStorage;

const CLEAN_INTERVAL: Duration = Duration::from_secs(10 * 60);
const AGGREGATION_RETENTION_HOURS: i64 = 2;
const SIGNAL_RETENTION_DAYS: i64 = 7;

pub struct DataCleaner {
    storage: Arc<dyn MonitorStorage>,
}

impl DataCleaner {
    pub fn new(storage: Arc<dyn MonitorStorage>) -> Self {
        Self { storage }
    }

    pub async fn run(self) {
        let mut ticker = interval(CLEAN_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    async fn sweep(&self) {
        let now = Utc::now();

        match self
            .storage
            .delete_aggregations_older_than(now - chrono::Duration::hours(AGGREGATION_RETENTION_HOURS))
            .await
        {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "Expired order aggregations cleaned"),
            Err(e) => warn!(error = %e, "Aggregation retention sweep failed"),
        }

        match self
            .storage
            .delete_signals_older_than(now - chrono::Duration::days(SIGNAL_RETENTION_DAYS))
            .await
        {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "Expired signal rows cleaned"),
            Err(e) => warn!(error = %e, "Signal retention sweep failed"),
        }
    }
}
