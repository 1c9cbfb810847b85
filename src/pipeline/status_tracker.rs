//! Out-of-order terminal status tracking
//!
//! A terminal order status can arrive before the matching fill does. The
//! tracker remembers it for a bounded window so the fill path can flush
//! immediately once the aggregation exists.

use std::time::Duration;

use moka::sync::Cache;

pub const STATUS_TTL: Duration = Duration::from_secs(10 * 60);
const MAX_ENTRIES: u64 = 100_000;

pub struct OrderStatusTracker {
    cache: Cache<String, String>,
}

impl Default for OrderStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderStatusTracker {
    pub fn new() -> Self {
        Self::with_ttl(STATUS_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(MAX_ENTRIES)
                .time_to_live(ttl)
                .build(),
        }
    }

    fn key(address: &str, oid: u64) -> String {
        format!("{address}-{oid}")
    }

    pub fn record(&self, address: &str, oid: u64, status: &str) {
        self.cache.insert(Self::key(address, oid), status.to_string());
    }

    pub fn get(&self, address: &str, oid: u64) -> Option<String> {
        self.cache.get(&Self::key(address, oid))
    }

    pub fn clear(&self, address: &str, oid: u64) {
        self.cache.invalidate(&Self::key(address, oid));
    }
}
