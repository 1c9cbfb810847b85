//! Order stream subscriber: userFills + orderUpdates per address
//!
//! Fills are age-filtered, reversal fills split into close/open legs, and
//! everything is dedup-gated before it reaches the queue. Order updates are
//! only forwarded for orders whose fills we have observed (the oid map),
//! and that map is scoped per address so one departure never disturbs
//! another address's in-flight orders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use super::AddressSubscriber;
use crate::models::{
    now_ms, parse_decimal, Direction, Fill, RawFrame, UserFillsData, WsFill, WsOrderUpdate,
    DIR_LONG_TO_SHORT, DIR_SHORT_TO_LONG,
};
use crate::pipeline::{DedupCache, MessageQueue, MonitorMessage};
use crate::ws::pool::FrameCallback;
use crate::ws::{Channel, PoolManager, Subscription, SubscriptionHandle};

/// Fills older than this (server time) are replays, not news.
const MAX_FILL_AGE_MS: i64 = 30 * 60 * 1000;

#[derive(Default)]
struct OrderSubMetrics {
    fills_seen: AtomicU64,
    fills_stale: AtomicU64,
    legs_enqueued: AtomicU64,
    updates_enqueued: AtomicU64,
    foreign_frames: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderSubStats {
    pub fills_seen: u64,
    pub fills_stale: u64,
    pub legs_enqueued: u64,
    pub updates_enqueued: u64,
    pub foreign_frames: u64,
    pub tracked_orders: usize,
}

pub struct OrderSubscriptionManager {
    pool: Arc<PoolManager>,
    queue: Arc<MessageQueue>,
    dedup: Arc<DedupCache>,
    oid_to_address: Arc<RwLock<HashMap<u64, String>>>,
    handles: Mutex<HashMap<String, Vec<SubscriptionHandle>>>,
    metrics: Arc<OrderSubMetrics>,
}

impl OrderSubscriptionManager {
    pub fn new(
        pool: Arc<PoolManager>,
        queue: Arc<MessageQueue>,
        dedup: Arc<DedupCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            queue,
            dedup,
            oid_to_address: Arc::new(RwLock::new(HashMap::new())),
            handles: Mutex::new(HashMap::new()),
            metrics: Arc::new(OrderSubMetrics::default()),
        })
    }

    /// Drop every remaining subscription (shutdown path).
    pub async fn close(&self) {
        let all: Vec<_> = self.handles.lock().drain().collect();
        for (_, handles) in all {
            for handle in handles {
                self.pool.unsubscribe(&handle).await;
            }
        }
    }

    pub fn stats(&self) -> OrderSubStats {
        OrderSubStats {
            fills_seen: self.metrics.fills_seen.load(Ordering::Relaxed),
            fills_stale: self.metrics.fills_stale.load(Ordering::Relaxed),
            legs_enqueued: self.metrics.legs_enqueued.load(Ordering::Relaxed),
            updates_enqueued: self.metrics.updates_enqueued.load(Ordering::Relaxed),
            foreign_frames: self.metrics.foreign_frames.load(Ordering::Relaxed),
            tracked_orders: self.oid_to_address.read().len(),
        }
    }

    fn fills_callback(&self, address: String) -> FrameCallback {
        let queue = self.queue.clone();
        let dedup = self.dedup.clone();
        let oid_map = self.oid_to_address.clone();
        let metrics = self.metrics.clone();
        Arc::new(move |frame: &RawFrame| {
            handle_fills_frame(&address, frame, &queue, &dedup, &oid_map, &metrics);
        })
    }

    fn updates_callback(&self, address: String) -> FrameCallback {
        let queue = self.queue.clone();
        let oid_map = self.oid_to_address.clone();
        let metrics = self.metrics.clone();
        Arc::new(move |frame: &RawFrame| {
            handle_updates_frame(&address, frame, &queue, &oid_map, &metrics);
        })
    }
}

#[async_trait]
impl AddressSubscriber for OrderSubscriptionManager {
    fn name(&self) -> &'static str {
        "orders"
    }

    async fn subscribe_address(&self, address: &str) -> Result<()> {
        let address = address.to_lowercase();

        let fills = self
            .pool
            .subscribe(
                Subscription::new(Channel::UserFills, &address),
                self.fills_callback(address.clone()),
            )
            .await?;

        let updates = match self
            .pool
            .subscribe(
                Subscription::new(Channel::OrderUpdates, &address),
                self.updates_callback(address.clone()),
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.pool.unsubscribe(&fills).await;
                return Err(e);
            }
        };

        self.handles
            .lock()
            .entry(address)
            .or_default()
            .extend([fills, updates]);
        Ok(())
    }

    async fn unsubscribe_address(&self, address: &str) -> Result<()> {
        let address = address.to_lowercase();
        let handles = self.handles.lock().remove(&address).unwrap_or_default();
        for handle in &handles {
            self.pool.unsubscribe(handle).await;
        }
        // only this address's order mappings go away
        self.oid_to_address.write().retain(|_, a| *a != address);
        Ok(())
    }
}

fn handle_fills_frame(
    address: &str,
    frame: &RawFrame,
    queue: &Arc<MessageQueue>,
    dedup: &Arc<DedupCache>,
    oid_map: &Arc<RwLock<HashMap<u64, String>>>,
    metrics: &Arc<OrderSubMetrics>,
) {
    let data: UserFillsData = match serde_json::from_value(frame.data.clone()) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "Undecodable userFills payload");
            return;
        }
    };

    // broadcast leak guard
    if data.user.to_lowercase() != address {
        metrics.foreign_frames.fetch_add(1, Ordering::Relaxed);
        warn!(expected = %address, got = %data.user, "userFills frame for another user dropped");
        return;
    }

    let now = now_ms();
    for ws_fill in &data.fills {
        metrics.fills_seen.fetch_add(1, Ordering::Relaxed);

        if now - ws_fill.time > MAX_FILL_AGE_MS {
            metrics.fills_stale.fetch_add(1, Ordering::Relaxed);
            debug!(oid = ws_fill.oid, tid = ws_fill.tid, "Stale fill dropped");
            continue;
        }

        // later order updates route through this mapping
        oid_map.write().insert(ws_fill.oid, address.to_string());

        for (direction, fill) in split_fill(ws_fill) {
            if dedup.is_seen(address, fill.oid, direction) {
                continue;
            }
            queue.enqueue(MonitorMessage::OrderFill {
                address: address.to_string(),
                fill,
                direction,
            });
            metrics.legs_enqueued.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn handle_updates_frame(
    address: &str,
    frame: &RawFrame,
    queue: &Arc<MessageQueue>,
    oid_map: &Arc<RwLock<HashMap<u64, String>>>,
    metrics: &Arc<OrderSubMetrics>,
) {
    let updates: Vec<WsOrderUpdate> = match serde_json::from_value(frame.data.clone()) {
        Ok(updates) => updates,
        Err(e) => {
            warn!(error = %e, "Undecodable orderUpdates payload");
            return;
        }
    };

    for update in updates {
        let oid = update.order.oid;

        // only orders we have observed fills for
        match oid_map.read().get(&oid) {
            Some(bound) if bound.as_str() == address => {}
            _ => continue,
        }

        if update.status == "open" || update.status == "triggered" {
            continue;
        }

        queue.enqueue(MonitorMessage::OrderUpdate {
            address: address.to_string(),
            oid,
            status: update.status.clone(),
        });
        metrics.updates_enqueued.fetch_add(1, Ordering::Relaxed);
        oid_map.write().remove(&oid);
    }
}

/// A reversal fill crosses through zero: it closes the old side for the
/// full start position and opens the new side with whatever remains.
pub(crate) fn split_fill(ws: &WsFill) -> Vec<(Direction, Fill)> {
    match ws.dir.as_str() {
        dir @ (DIR_LONG_TO_SHORT | DIR_SHORT_TO_LONG) => {
            let start = parse_decimal(&ws.start_position).abs();
            let total = parse_decimal(&ws.sz);
            let close_size = start;
            let open_size = (total - start).max(0.0);

            let (close_dir, open_dir) = if dir == DIR_LONG_TO_SHORT {
                (Direction::CloseLong, Direction::OpenShort)
            } else {
                (Direction::CloseShort, Direction::OpenLong)
            };

            vec![
                (close_dir, leg(ws, close_size)),
                (open_dir, leg(ws, open_size)),
            ]
        }
        other => match Direction::parse(other) {
            Some(direction) => vec![(direction, Fill::from_ws(ws))],
            None => {
                debug!(dir = other, oid = ws.oid, "Fill with unhandled direction ignored");
                Vec::new()
            }
        },
    }
}

fn leg(ws: &WsFill, size: f64) -> Fill {
    let mut fill = Fill::from_ws(ws);
    fill.sz = format!("{size}");
    fill
}
