//! Cross-restart signal dedup
//!
//! TTL-keyed `address-oid-direction` fingerprints. Warmed from storage at
//! startup with every already-sent aggregation inside the TTL horizon,
//! which gives at-most-once signal emission across restarts.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use moka::sync::Cache;
use tracing::info;

use crate::models::Direction;
use crate::storage::MonitorStorage;

pub const DEDUP_TTL: Duration = Duration::from_secs(30 * 60);
const MAX_ENTRIES: u64 = 200_000;

pub struct DedupCache {
    cache: Cache<String, ()>,
    ttl: Duration,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_ttl(DEDUP_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(MAX_ENTRIES)
                .time_to_live(ttl)
                .build(),
            ttl,
        }
    }

    pub fn key(address: &str, oid: u64, direction: Direction) -> String {
        format!("{}-{}-{}", address, oid, direction.as_str())
    }

    pub fn is_seen(&self, address: &str, oid: u64, direction: Direction) -> bool {
        self.cache.contains_key(&Self::key(address, oid, direction))
    }

    pub fn mark(&self, address: &str, oid: u64, direction: Direction) {
        self.cache.insert(Self::key(address, oid, direction), ());
    }

    /// Load every sent aggregation inside the TTL window and mark it seen.
    pub async fn warm_up(&self, storage: &dyn MonitorStorage) -> Result<usize> {
        let since = Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::minutes(30));
        let rows = storage.get_sent_orders_since(since).await?;

        let mut marked = 0usize;
        for row in &rows {
            if let Some(direction) = Direction::parse(&row.direction) {
                self.mark(&row.address, row.order_id, direction);
                marked += 1;
            }
        }
        info!(marked, "Dedup cache warmed from storage");
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_check() {
        let cache = DedupCache::new();
        assert!(!cache.is_seen("0xaa", 7, Direction::OpenLong));
        cache.mark("0xaa", 7, Direction::OpenLong);
        assert!(cache.is_seen("0xaa", 7, Direction::OpenLong));
        // direction is part of the key
        assert!(!cache.is_seen("0xaa", 7, Direction::CloseLong));
        assert!(!cache.is_seen("0xbb", 7, Direction::OpenLong));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = DedupCache::with_ttl(Duration::from_millis(50));
        cache.mark("0xaa", 7, Direction::Buy);
        assert!(cache.is_seen("0xaa", 7, Direction::Buy));
        std::thread::sleep(Duration::from_millis(80));
        assert!(!cache.is_seen("0xaa", 7, Direction::Buy));
    }
}
