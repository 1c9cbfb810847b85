//! Last-seen spot and perp prices, keyed by canonical coin.

use std::collections::HashMap;

use parking_lot::RwLock;

#[derive(Default)]
pub struct PriceCache {
    spot: RwLock<HashMap<String, f64>>,
    perp: RwLock<HashMap<String, f64>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_spot_price(&self, coin: &str, price: f64) {
        self.spot.write().insert(coin.to_string(), price);
    }

    pub fn get_spot_price(&self, coin: &str) -> Option<f64> {
        self.spot.read().get(coin).copied()
    }

    pub fn set_perp_price(&self, coin: &str, price: f64) {
        self.perp.write().insert(coin.to_string(), price);
    }

    pub fn get_perp_price(&self, coin: &str) -> Option<f64> {
        self.perp.read().get(coin).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let cache = PriceCache::new();
        assert_eq!(cache.get_spot_price("HYPE"), None);
        cache.set_spot_price("HYPE", 38.5);
        cache.set_spot_price("HYPE", 38.7);
        assert_eq!(cache.get_spot_price("HYPE"), Some(38.7));
        assert_eq!(cache.get_perp_price("HYPE"), None);
    }
}
