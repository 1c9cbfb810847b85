//! Account snapshot subscriber: webData2 per address
//!
//! Each snapshot refreshes spot prices, rebuilds the address's balance
//! record for the in-memory cache (the fast path the order processor reads)
//! and forwards a durable row through the position queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::AddressSubscriber;
use crate::caches::symbol::normalize_perp_coin;
use crate::caches::{PositionBalanceCache, PriceCache, SymbolCache};
use crate::models::{
    now_ms, parse_decimal, FuturesPositionEntry, PositionRecord, RawFrame, SpotBalanceEntry,
    WebData2,
};
use crate::pipeline::{MessageQueue, MonitorMessage};
use crate::ws::pool::FrameCallback;
use crate::ws::{Channel, PoolManager, Subscription, SubscriptionHandle};

const STABLECOINS: [&str; 3] = ["USDC", "USDT", "USDH"];

#[derive(Default)]
struct PositionSubMetrics {
    snapshots: AtomicU64,
    foreign_frames: AtomicU64,
    unpriced_balances: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionSubStats {
    pub snapshots: u64,
    pub foreign_frames: u64,
    pub unpriced_balances: u64,
}

pub struct PositionManager {
    pool: Arc<PoolManager>,
    queue: Arc<MessageQueue>,
    prices: Arc<PriceCache>,
    symbols: Arc<SymbolCache>,
    balances: Arc<PositionBalanceCache>,
    handles: Mutex<HashMap<String, SubscriptionHandle>>,
    metrics: Arc<PositionSubMetrics>,
}

impl PositionManager {
    pub fn new(
        pool: Arc<PoolManager>,
        queue: Arc<MessageQueue>,
        prices: Arc<PriceCache>,
        symbols: Arc<SymbolCache>,
        balances: Arc<PositionBalanceCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            queue,
            prices,
            symbols,
            balances,
            handles: Mutex::new(HashMap::new()),
            metrics: Arc::new(PositionSubMetrics::default()),
        })
    }

    pub async fn close(&self) {
        let all: Vec<_> = self.handles.lock().drain().collect();
        for (_, handle) in all {
            self.pool.unsubscribe(&handle).await;
        }
    }

    pub fn stats(&self) -> PositionSubStats {
        PositionSubStats {
            snapshots: self.metrics.snapshots.load(Ordering::Relaxed),
            foreign_frames: self.metrics.foreign_frames.load(Ordering::Relaxed),
            unpriced_balances: self.metrics.unpriced_balances.load(Ordering::Relaxed),
        }
    }

    fn snapshot_callback(&self, address: String) -> FrameCallback {
        let queue = self.queue.clone();
        let prices = self.prices.clone();
        let symbols = self.symbols.clone();
        let balances = self.balances.clone();
        let metrics = self.metrics.clone();
        Arc::new(move |frame: &RawFrame| {
            handle_snapshot_frame(&address, frame, &queue, &prices, &symbols, &balances, &metrics);
        })
    }
}

#[async_trait]
impl AddressSubscriber for PositionManager {
    fn name(&self) -> &'static str {
        "positions"
    }

    async fn subscribe_address(&self, address: &str) -> Result<()> {
        let address = address.to_lowercase();
        let handle = self
            .pool
            .subscribe(
                Subscription::new(Channel::WebData2, &address),
                self.snapshot_callback(address.clone()),
            )
            .await?;
        self.handles.lock().insert(address, handle);
        Ok(())
    }

    async fn unsubscribe_address(&self, address: &str) -> Result<()> {
        let address = address.to_lowercase();
        let handle = self.handles.lock().remove(&address);
        if let Some(handle) = handle {
            self.pool.unsubscribe(&handle).await;
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_snapshot_frame(
    address: &str,
    frame: &RawFrame,
    queue: &Arc<MessageQueue>,
    prices: &Arc<PriceCache>,
    symbols: &Arc<SymbolCache>,
    balances: &Arc<PositionBalanceCache>,
    metrics: &Arc<PositionSubMetrics>,
) {
    let data: WebData2 = match serde_json::from_value(frame.data.clone()) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "Undecodable webData2 payload");
            return;
        }
    };

    if !data.user.is_empty() && data.user.to_lowercase() != address {
        metrics.foreign_frames.fetch_add(1, Ordering::Relaxed);
        warn!(expected = %address, got = %data.user, "webData2 frame for another user dropped");
        return;
    }

    // snapshot carries fresh spot marks; keyed by display symbol
    for ctx in &data.spot_asset_ctxs {
        let px = ctx
            .mid_px
            .as_deref()
            .or(ctx.mark_px.as_deref())
            .map(parse_decimal)
            .unwrap_or(0.0);
        if px > 0.0 {
            let display = symbols
                .get_spot_symbol(&ctx.coin)
                .unwrap_or_else(|| ctx.coin.clone());
            prices.set_spot_price(&display, px);
        }
    }

    let record = build_position_record(address, &data, prices, symbols, metrics);

    metrics.snapshots.fetch_add(1, Ordering::Relaxed);
    metrics::counter!("position_snapshots_total", 1);

    // fast path for ratio calculations, then the durable row
    balances.update(address, record.clone());
    queue.enqueue(MonitorMessage::PositionSnapshot {
        address: address.to_string(),
        record,
    });
}

fn build_position_record(
    address: &str,
    data: &WebData2,
    prices: &Arc<PriceCache>,
    symbols: &Arc<SymbolCache>,
    metrics: &Arc<PositionSubMetrics>,
) -> PositionRecord {
    let mut spot_total_usd = 0.0;
    let mut spot_balances = Vec::new();
    if let Some(spot) = &data.spot_state {
        for balance in &spot.balances {
            let total = parse_decimal(&balance.total);
            if total <= 0.0 {
                continue;
            }
            let price = if STABLECOINS.contains(&balance.coin.as_str()) {
                1.0
            } else {
                let display = format!("{}/USDC", balance.coin);
                match prices.get_spot_price(&display) {
                    Some(px) => px,
                    None => {
                        metrics.unpriced_balances.fetch_add(1, Ordering::Relaxed);
                        debug!(coin = %balance.coin, "No spot price for balance, contributes 0");
                        0.0
                    }
                }
            };
            spot_total_usd += total * price;
            spot_balances.push(SpotBalanceEntry {
                coin: balance.coin.clone(),
                total,
            });
        }
    }

    let mut futures_positions = Vec::new();
    for asset in &data.clearinghouse_state.asset_positions {
        let szi = parse_decimal(&asset.position.szi);
        if szi == 0.0 {
            continue;
        }
        let symbol = symbols
            .get_perp_symbol(&asset.position.coin)
            .unwrap_or_else(|| normalize_perp_coin(&asset.position.coin).to_string());
        futures_positions.push(FuturesPositionEntry { symbol, szi });
    }

    // cross account value preferred; the plain summary covers isolated-only
    let cross = data
        .clearinghouse_state
        .cross_margin_summary
        .as_ref()
        .map(|m| parse_decimal(&m.account_value))
        .unwrap_or(0.0);
    let account_value = if cross > 0.0 {
        cross
    } else {
        parse_decimal(&data.clearinghouse_state.margin_summary.account_value)
    };

    let snapshot_time = if data.clearinghouse_state.time > 0 {
        data.clearinghouse_state.time
    } else {
        now_ms()
    };

    PositionRecord {
        address: address.to_string(),
        spot_total_usd,
        account_value,
        spot_balances,
        futures_positions,
        snapshot_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_data() -> WebData2 {
        serde_json::from_str(
            r#"{
                "user": "0xaa",
                "clearinghouseState": {
                    "marginSummary": { "accountValue": "900.0" },
                    "crossMarginSummary": { "accountValue": "1000.0" },
                    "assetPositions": [
                        { "position": { "coin": "ETH", "szi": "-2.0" } },
                        { "position": { "coin": "xyz:BTC", "szi": "0.5" } },
                        { "position": { "coin": "SOL", "szi": "0.0" } }
                    ],
                    "time": 1719000000000
                },
                "spotState": {
                    "balances": [
                        { "coin": "USDC", "total": "500.0" },
                        { "coin": "HYPE", "total": "10.0" },
                        { "coin": "PURR", "total": "7.0" }
                    ]
                },
                "spotAssetCtxs": []
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_record_math() {
        let prices = Arc::new(PriceCache::new());
        prices.set_spot_price("HYPE/USDC", 40.0);
        // PURR has no price: contributes 0
        let symbols = SymbolCache::new();
        let mut perp = HashMap::new();
        perp.insert("ETH".to_string(), "ETH".to_string());
        symbols.replace_perp(perp);
        let metrics = Arc::new(PositionSubMetrics::default());

        let record = build_position_record("0xaa", &test_data(), &prices, &symbols, &metrics);

        // 500 USDC at 1.0 + 10 HYPE at 40 + 7 unpriced PURR
        assert!((record.spot_total_usd - 900.0).abs() < 1e-6);
        // cross preferred over the plain summary
        assert!((record.account_value - 1000.0).abs() < 1e-6);
        // zero positions skipped, dex prefix stripped
        assert_eq!(record.futures_positions.len(), 2);
        assert_eq!(record.futures_position("ETH"), Some(2.0));
        assert_eq!(record.futures_position("BTC"), Some(0.5));
        assert_eq!(metrics.unpriced_balances.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_isolated_fallback_for_account_value() {
        let mut data = test_data();
        data.clearinghouse_state.cross_margin_summary = None;
        let prices = Arc::new(PriceCache::new());
        let symbols = SymbolCache::new();
        let metrics = Arc::new(PositionSubMetrics::default());

        let record = build_position_record("0xaa", &data, &prices, &symbols, &metrics);
        assert!((record.account_value - 900.0).abs() < 1e-6);
    }
}
