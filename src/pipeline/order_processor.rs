//! Order aggregation engine
//!
//! Fills accumulate per (address, order id, direction) until a terminal
//! status or a timeout flushes them as one signal. Status frames may beat
//! their fills across channels; the status tracker bridges that race.
//! Publish failures leave the aggregation open so the next trigger
//! retries; the dedup cache is marked before the pending entry is deleted,
//! which is what makes emission at-most-once.
//!
//! Per-aggregation state machine: INIT -> OPEN -> FLUSHING -> SENT. A
//! failed publish drops FLUSHING back to OPEN.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::dedup::DedupCache;
use super::queue::{MessageHandler, MonitorMessage};
use super::status_tracker::OrderStatusTracker;
use crate::bus::SignalPublisher;
use crate::caches::{PositionBalanceCache, SymbolCache};
use crate::config::AggregationConfig;
use crate::models::{now_ms, Direction, Fill, OrderAggregationRow, Signal};
use crate::storage::{BatchItem, BatchWriter, MonitorStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Status,
    Timeout,
    Manual,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Status => "status",
            FlushTrigger::Timeout => "timeout",
            FlushTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
struct FlushRequest {
    key: String,
    trigger: FlushTrigger,
    status: String,
}

/// Pending per-order accumulator. Owned by the pending map; mutated only
/// behind its own mutex.
pub struct OrderAggregation {
    pub address: String,
    pub oid: u64,
    pub direction: Direction,
    pub symbol: String,
    pub fills: Vec<Fill>,
    pub total_size: f64,
    pub avg_price: f64,
    pub last_fill_time: i64,
    pub first_fill_wall: Instant,
    pub status: String,
    pub signal_sent: bool,
    pub flushing: bool,
    pub seen_tids: HashSet<u64>,
}

impl OrderAggregation {
    fn new(address: &str, oid: u64, direction: Direction, symbol: &str) -> Self {
        Self {
            address: address.to_string(),
            oid,
            direction,
            symbol: symbol.to_string(),
            fills: Vec::new(),
            total_size: 0.0,
            avg_price: 0.0,
            last_fill_time: 0,
            first_fill_wall: Instant::now(),
            status: "open".to_string(),
            signal_sent: false,
            flushing: false,
            seen_tids: HashSet::new(),
        }
    }

    /// Append one fill and recompute the totals. Returns false for a
    /// duplicate trade id.
    fn append(&mut self, fill: Fill) -> bool {
        if !self.seen_tids.insert(fill.tid) {
            return false;
        }
        self.last_fill_time = self.last_fill_time.max(fill.time);
        self.fills.push(fill);
        self.recompute();
        true
    }

    fn recompute(&mut self) {
        let total: f64 = self.fills.iter().map(Fill::size).sum();
        self.total_size = total;
        self.avg_price = if total > 0.0 {
            self.fills.iter().map(|f| f.size() * f.price()).sum::<f64>() / total
        } else {
            0.0
        };
    }

    fn first_fill_time(&self) -> i64 {
        self.fills.first().map(|f| f.time).unwrap_or_else(now_ms)
    }

    fn to_row(&self) -> OrderAggregationRow {
        OrderAggregationRow {
            address: self.address.clone(),
            order_id: self.oid,
            direction: self.direction.as_str().to_string(),
            symbol: self.symbol.clone(),
            total_size: self.total_size,
            avg_price: self.avg_price,
            fill_count: self.fills.len() as u32,
            order_status: self.status.clone(),
            signal_sent: self.signal_sent,
            first_fill_time: self.first_fill_time(),
            last_fill_time: self.last_fill_time,
            fills_json: serde_json::to_string(&self.fills).unwrap_or_default(),
        }
    }
}

#[derive(Default)]
struct ProcessorMetrics {
    fills_processed: AtomicU64,
    fills_deduped: AtomicU64,
    duplicate_tids: AtomicU64,
    signals_published: AtomicU64,
    publish_failures: AtomicU64,
    flushes_dropped: AtomicU64,
    timeout_flushes: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStats {
    pub fills_processed: u64,
    pub fills_deduped: u64,
    pub duplicate_tids: u64,
    pub signals_published: u64,
    pub publish_failures: u64,
    pub flushes_dropped: u64,
    pub timeout_flushes: u64,
    pub pending: usize,
}

pub struct OrderProcessor {
    config: AggregationConfig,
    pending: RwLock<HashMap<String, Arc<Mutex<OrderAggregation>>>>,
    flush_tx: mpsc::Sender<FlushRequest>,
    status_tracker: OrderStatusTracker,
    dedup: Arc<DedupCache>,
    symbols: Arc<SymbolCache>,
    balances: Arc<PositionBalanceCache>,
    batch_writer: Arc<BatchWriter>,
    publisher: Arc<dyn SignalPublisher>,
    storage: Arc<dyn MonitorStorage>,
    metrics: ProcessorMetrics,
}

/// Stable pending/dedup key for one aggregation.
pub fn aggregation_key(address: &str, oid: u64, direction: Direction) -> String {
    format!("{}-{}-{}", address, oid, direction.as_str())
}

impl OrderProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: AggregationConfig,
        dedup: Arc<DedupCache>,
        symbols: Arc<SymbolCache>,
        balances: Arc<PositionBalanceCache>,
        batch_writer: Arc<BatchWriter>,
        publisher: Arc<dyn SignalPublisher>,
        storage: Arc<dyn MonitorStorage>,
    ) -> Arc<Self> {
        let (flush_tx, flush_rx) = mpsc::channel(config.flush_queue_size);

        let processor = Arc::new(Self {
            config,
            pending: RwLock::new(HashMap::new()),
            flush_tx,
            status_tracker: OrderStatusTracker::new(),
            dedup,
            symbols,
            balances,
            batch_writer,
            publisher,
            storage,
            metrics: ProcessorMetrics::default(),
        });

        tokio::spawn(Arc::clone(&processor).run_flush_workers(flush_rx));
        tokio::spawn(Arc::clone(&processor).run_timeout_scanner());
        processor
    }

    // ------------------------------------------------------------------
    // Fill path
    // ------------------------------------------------------------------

    fn handle_fill(&self, address: &str, fill: Fill, direction: Direction) {
        let key = aggregation_key(address, fill.oid, direction);

        if self.dedup.is_seen(address, fill.oid, direction) {
            self.metrics.fills_deduped.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, tid = fill.tid, "Fill for already-signaled order, skipping");
            return;
        }

        // A terminal status may already be waiting for this order.
        let pending_status = self.status_tracker.get(address, fill.oid);
        let oid = fill.oid;

        let symbol = self.resolve_symbol(&fill.coin, direction);

        // read guard must drop before a write is attempted on the same map
        let existing = self.pending.read().get(&key).cloned();
        let agg_arc = match existing {
            Some(agg) => agg,
            None => self
                .pending
                .write()
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(OrderAggregation::new(
                        address, oid, direction, &symbol,
                    )))
                })
                .clone(),
        };

        let row = {
            let mut agg = agg_arc.lock();
            if agg.signal_sent {
                return;
            }
            if !agg.append(fill) {
                self.metrics.duplicate_tids.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Duplicate trade id dropped");
                return;
            }
            agg.to_row()
        };

        self.metrics.fills_processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("order_fills_processed_total", 1);

        if self.batch_writer.add(BatchItem::OrderAggregation(row)).is_err() {
            warn!(key = %key, "Batch writer saturated, aggregation persist skipped");
        }

        if let Some(status) = pending_status {
            self.enqueue_flush(&key, FlushTrigger::Status, &status);
            self.status_tracker.clear(address, oid);
        }
    }

    fn resolve_symbol(&self, coin: &str, direction: Direction) -> String {
        let resolved = if direction.is_spot() {
            self.symbols.get_spot_symbol(coin)
        } else {
            self.symbols.get_perp_symbol(coin)
        };
        resolved.unwrap_or_else(|| {
            debug!(coin, %direction, "No display symbol, falling back to raw coin");
            coin.to_string()
        })
    }

    // ------------------------------------------------------------------
    // Status path
    // ------------------------------------------------------------------

    fn handle_update(&self, address: &str, oid: u64, status: &str) {
        // Record first so a fill racing us on the other channel finds it.
        self.status_tracker.record(address, oid, status);

        let mut matched = false;
        for direction in Direction::ALL {
            let key = aggregation_key(address, oid, direction);
            if self.pending.read().contains_key(&key) {
                self.enqueue_flush(&key, FlushTrigger::Status, status);
                matched = true;
            }
        }
        if matched {
            self.status_tracker.clear(address, oid);
        }
    }

    fn enqueue_flush(&self, key: &str, trigger: FlushTrigger, status: &str) {
        let req = FlushRequest {
            key: key.to_string(),
            trigger,
            status: status.to_string(),
        };
        if self.flush_tx.try_send(req).is_err() {
            // the timeout scanner will pick the aggregation up again
            self.metrics.flushes_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(key, "Flush queue full, request dropped");
        }
    }

    // ------------------------------------------------------------------
    // Flush path
    // ------------------------------------------------------------------

    async fn run_flush_workers(self: Arc<Self>, mut rx: mpsc::Receiver<FlushRequest>) {
        let workers = Arc::new(Semaphore::new(self.config.flush_workers));
        while let Some(req) = rx.recv().await {
            let Ok(permit) = workers.clone().acquire_owned().await else {
                return;
            };
            let me = Arc::clone(&self);
            tokio::spawn(async move {
                me.flush(&req.key, req.trigger, &req.status).await;
                drop(permit);
            });
        }
    }

    async fn run_timeout_scanner(self: Arc<Self>) {
        let mut ticker = interval(self.config.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let timeout = self.config.timeout();
            let now = Instant::now();

            let expired: Vec<String> = {
                let pending = self.pending.read();
                pending
                    .iter()
                    .filter(|(_, agg)| {
                        let agg = agg.lock();
                        !agg.signal_sent
                            && !agg.flushing
                            && now.duration_since(agg.first_fill_wall) >= timeout
                    })
                    .map(|(key, _)| key.clone())
                    .collect()
            };

            for key in expired {
                self.metrics.timeout_flushes.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Aggregation timed out, flushing");
                self.enqueue_flush(&key, FlushTrigger::Timeout, "filled");
            }
        }
    }

    /// Flush one aggregation: publish, seal, persist, dedup-mark, drop.
    pub async fn flush(&self, key: &str, trigger: FlushTrigger, status: &str) {
        let Some(agg_arc) = self.pending.read().get(key).cloned() else {
            return;
        };

        // Claim the aggregation; anything already sent or mid-flush is left
        // alone.
        let (signal, address, oid, direction) = {
            let mut agg = agg_arc.lock();
            if agg.signal_sent || agg.flushing || agg.fills.is_empty() {
                return;
            }
            agg.flushing = true;
            (
                self.build_signal(&agg),
                agg.address.clone(),
                agg.oid,
                agg.direction,
            )
        };

        if let Err(e) = self.publisher.publish_address_signal(&signal).await {
            self.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("signal_publish_failures_total", 1);
            warn!(key, error = %e, "Publish failed, aggregation stays open for retry");
            agg_arc.lock().flushing = false;
            return;
        }

        self.metrics.signals_published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("signals_published_total", 1);

        let row = {
            let mut agg = agg_arc.lock();
            agg.signal_sent = true;
            agg.flushing = false;
            agg.status = status.to_string();
            agg.to_row()
        };

        // Mark before deleting from pending: a racing fill must hit the
        // dedup layer, not recreate the aggregation.
        self.dedup.mark(&address, oid, direction);

        if self.batch_writer.add(BatchItem::OrderAggregation(row)).is_err() {
            warn!(key, "Batch writer saturated, sealed aggregation persist skipped");
        }
        self.pending.write().remove(key);

        if let Err(e) = self.storage.create_signal(&signal).await {
            warn!(key, error = %e, "Signal row persist failed (non-fatal)");
        }

        info!(
            address = %address,
            oid,
            symbol = %signal.symbol,
            direction = %signal.direction,
            side = %signal.side,
            size = signal.size,
            price = signal.price,
            trigger = trigger.as_str(),
            "Signal published"
        );
    }

    fn build_signal(&self, agg: &OrderAggregation) -> Signal {
        let direction = agg.direction;
        let size = agg.total_size;
        let price = agg.avg_price;
        let balance = self.balances.get(&agg.address);

        let total_balance = balance
            .as_ref()
            .map(|b| {
                if direction.is_spot() {
                    b.spot_total_usd
                } else {
                    b.account_value
                }
            })
            .unwrap_or(0.0);
        let position_rate = if total_balance > 0.0 {
            round2(price * size / total_balance * 100.0)
        } else {
            100.00
        };

        let close_rate = if direction.is_close() {
            let current = balance.as_ref().and_then(|b| {
                if direction.is_spot() {
                    b.spot_balance(strip_usdc_suffix(&agg.symbol))
                } else {
                    b.futures_position(&agg.symbol)
                }
            });
            match current {
                Some(position) if position > 0.0 => (size / position).min(1.0),
                _ => 0.0,
            }
        } else {
            0.0
        };

        Signal {
            address: agg.address.clone(),
            asset_type: direction.asset_type().as_str().to_string(),
            symbol: agg.symbol.clone(),
            direction: direction.action().to_string(),
            side: direction.side().to_string(),
            position_rate,
            close_rate,
            size,
            price,
            timestamp: agg.first_fill_time(),
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    /// Snapshot of one pending aggregation, for tests and /status.
    pub fn pending_row(&self, key: &str) -> Option<OrderAggregationRow> {
        self.pending.read().get(key).map(|agg| agg.lock().to_row())
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            fills_processed: self.metrics.fills_processed.load(Ordering::Relaxed),
            fills_deduped: self.metrics.fills_deduped.load(Ordering::Relaxed),
            duplicate_tids: self.metrics.duplicate_tids.load(Ordering::Relaxed),
            signals_published: self.metrics.signals_published.load(Ordering::Relaxed),
            publish_failures: self.metrics.publish_failures.load(Ordering::Relaxed),
            flushes_dropped: self.metrics.flushes_dropped.load(Ordering::Relaxed),
            timeout_flushes: self.metrics.timeout_flushes.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }
}

impl MessageHandler for OrderProcessor {
    fn handle(&self, msg: MonitorMessage) -> anyhow::Result<()> {
        match msg {
            MonitorMessage::OrderFill {
                address,
                fill,
                direction,
            } => self.handle_fill(&address, fill, direction),
            MonitorMessage::OrderUpdate {
                address,
                oid,
                status,
            } => self.handle_update(&address, oid, &status),
            MonitorMessage::PositionSnapshot { .. } => {
                warn!("Position snapshot routed to order processor, dropped");
            }
        }
        Ok(())
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Spot balances are keyed by bare coin; displays carry the quote suffix.
fn strip_usdc_suffix(symbol: &str) -> &str {
    symbol
        .strip_suffix("/USDC")
        .or_else(|| symbol.strip_suffix("USDC"))
        .unwrap_or(symbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(oid: u64, tid: u64, sz: &str, px: &str, time: i64) -> Fill {
        Fill {
            oid,
            tid,
            coin: "ETH".to_string(),
            side: "B".to_string(),
            sz: sz.to_string(),
            px: px.to_string(),
            start_position: 0.0,
            time,
        }
    }

    #[test]
    fn test_weighted_average() {
        let mut agg = OrderAggregation::new("0xaa", 1, Direction::OpenLong, "ETH");
        assert!(agg.append(fill(1, 10, "1.5", "100.0", 1000)));
        assert!(agg.append(fill(1, 11, "0.5", "102.0", 2000)));

        assert!((agg.total_size - 2.0).abs() < 1e-6);
        assert!((agg.avg_price - 100.5).abs() < 1e-6);
        assert_eq!(agg.last_fill_time, 2000);
        assert_eq!(agg.first_fill_time(), 1000);
    }

    #[test]
    fn test_duplicate_tid_rejected() {
        let mut agg = OrderAggregation::new("0xaa", 1, Direction::OpenLong, "ETH");
        assert!(agg.append(fill(1, 10, "1.0", "100.0", 1000)));
        assert!(!agg.append(fill(1, 10, "1.0", "100.0", 1000)));
        assert_eq!(agg.fills.len(), 1);
        assert!((agg.total_size - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_size_average() {
        let mut agg = OrderAggregation::new("0xaa", 1, Direction::OpenLong, "ETH");
        assert!(agg.append(fill(1, 10, "0", "100.0", 1000)));
        assert_eq!(agg.total_size, 0.0);
        assert_eq!(agg.avg_price, 0.0);
    }

    #[test]
    fn test_strip_usdc_suffix() {
        assert_eq!(strip_usdc_suffix("HYPE/USDC"), "HYPE");
        assert_eq!(strip_usdc_suffix("HYPEUSDC"), "HYPE");
        assert_eq!(strip_usdc_suffix("ETH"), "ETH");
    }

    #[test]
    fn test_aggregation_key_includes_direction() {
        assert_ne!(
            aggregation_key("0xaa", 7, Direction::CloseLong),
            aggregation_key("0xaa", 7, Direction::OpenShort)
        );
    }

    #[test]
    fn test_row_snapshot() {
        let mut agg = OrderAggregation::new("0xaa", 9, Direction::Sell, "HYPE/USDC");
        agg.append(fill(9, 1, "2.0", "38.5", 500));
        let row = agg.to_row();
        assert_eq!(row.order_id, 9);
        assert_eq!(row.direction, "Sell");
        assert_eq!(row.fill_count, 1);
        assert!(!row.signal_sent);
        assert!(row.fills_json.contains("38.5"));
    }
}
