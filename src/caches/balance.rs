//! Per-address balance snapshots used for position/close ratio calculations
//!
//! Written only by the position pipeline; read by the order processor.
//! Staleness of one snapshot interval is acceptable by design.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::models::PositionRecord;

#[derive(Default)]
pub struct PositionBalanceCache {
    inner: RwLock<HashMap<String, PositionRecord>>,
}

impl PositionBalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, address: &str, record: PositionRecord) {
        self.inner.write().insert(address.to_lowercase(), record);
    }

    /// Snapshot copy of the latest record for an address.
    pub fn get(&self, address: &str) -> Option<PositionRecord> {
        self.inner.read().get(&address.to_lowercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
