//! Watch-list reconciliation with a removal grace window
//!
//! The active-address table is owned by another service and can flap. A
//! disappeared address enters `pending_remove` and keeps its subscriptions
//! until the grace window elapses; reappearing inside the window costs
//! neither an unsubscribe nor a duplicate subscribe, so in-flight fills
//! survive source-table glitches.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::AddressSubscriber;
use crate::storage::MonitorStorage;

struct LoaderState {
    /// Last known watch set (desired ∪ pending_remove).
    last: HashSet<String>,
    /// Disappeared addresses and when they disappeared.
    pending_remove: HashMap<String, Instant>,
}

#[derive(Default)]
struct LoaderMetrics {
    sweeps: AtomicU64,
    added: AtomicU64,
    removed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoaderStats {
    pub sweeps: u64,
    pub added: u64,
    pub removed: u64,
    pub watched: usize,
    pub pending_remove: usize,
}

pub struct AddressLoader {
    storage: Arc<dyn MonitorStorage>,
    subscribers: RwLock<Vec<Arc<dyn AddressSubscriber>>>,
    /// One reconciliation at a time; held across the whole sweep.
    state: tokio::sync::Mutex<LoaderState>,
    reload_interval: Duration,
    remove_grace: Duration,
    stopped: AtomicBool,
    metrics: LoaderMetrics,
}

impl AddressLoader {
    pub fn new(
        storage: Arc<dyn MonitorStorage>,
        reload_interval: Duration,
        remove_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            subscribers: RwLock::new(Vec::new()),
            state: tokio::sync::Mutex::new(LoaderState {
                last: HashSet::new(),
                pending_remove: HashMap::new(),
            }),
            reload_interval,
            remove_grace,
            stopped: AtomicBool::new(false),
            metrics: LoaderMetrics::default(),
        })
    }

    /// Register before the first sweep; late registrants miss earlier adds.
    pub fn register(&self, subscriber: Arc<dyn AddressSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.reload_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.stopped.load(Ordering::Acquire) {
                info!("Address loader stopped");
                return;
            }
            if let Err(e) = self.reconcile_now().await {
                warn!(error = %e, "Address reconciliation failed, will retry next sweep");
            }
        }
    }

    /// One reconciliation sweep, serialized by the state mutex.
    pub async fn reconcile_now(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let desired: HashSet<String> = self
            .storage
            .list_active_addresses()
            .await?
            .into_iter()
            .map(|a| a.to_lowercase())
            .collect();

        let prev = std::mem::take(&mut state.last);
        let mut pending = std::mem::take(&mut state.pending_remove);

        // Fresh addresses. A pending_remove address is still in `prev`, so
        // its reappearance lands in the reprieve below, not here.
        let to_add: Vec<String> = desired
            .iter()
            .filter(|a| !prev.contains(*a))
            .cloned()
            .collect();

        // Reappeared inside the grace window: keep the live subscription.
        let before = pending.len();
        pending.retain(|addr, _| !desired.contains(addr));
        let reprieved = before - pending.len();

        // Newly disappeared: start the clock.
        for addr in prev.iter() {
            if !desired.contains(addr) && !pending.contains_key(addr) {
                debug!(address = %addr, "Address disappeared, grace window started");
                pending.insert(addr.clone(), now);
            }
        }

        // Grace expired: actually remove.
        let mut to_remove = Vec::new();
        pending.retain(|addr, since| {
            if now.duration_since(*since) >= self.remove_grace {
                to_remove.push(addr.clone());
                false
            } else {
                true
            }
        });

        let mut next = desired;
        next.extend(pending.keys().cloned());
        let watched = next.len();
        let pending_count = pending.len();
        state.last = next;
        state.pending_remove = pending;

        // Subscribers are notified while the sweep mutex is held; failures
        // are logged and the sweep continues.
        let subscribers: Vec<_> = self.subscribers.read().clone();
        for addr in &to_add {
            for sub in &subscribers {
                if let Err(e) = sub.subscribe_address(addr).await {
                    warn!(subscriber = sub.name(), address = %addr, error = %e, "Subscribe failed");
                }
            }
        }
        for addr in &to_remove {
            for sub in &subscribers {
                if let Err(e) = sub.unsubscribe_address(addr).await {
                    warn!(subscriber = sub.name(), address = %addr, error = %e, "Unsubscribe failed");
                }
            }
        }

        self.metrics.sweeps.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .added
            .fetch_add(to_add.len() as u64, Ordering::Relaxed);
        self.metrics
            .removed
            .fetch_add(to_remove.len() as u64, Ordering::Relaxed);
        metrics::gauge!("watched_addresses", watched as f64);

        if !to_add.is_empty() || !to_remove.is_empty() || reprieved > 0 {
            info!(
                added = to_add.len(),
                removed = to_remove.len(),
                reprieved,
                watched,
                pending_remove = pending_count,
                "Watch list reconciled"
            );
        }
        Ok(())
    }

    pub async fn stats(&self) -> LoaderStats {
        let state = self.state.lock().await;
        LoaderStats {
            sweeps: self.metrics.sweeps.load(Ordering::Relaxed),
            added: self.metrics.added.load(Ordering::Relaxed),
            removed: self.metrics.removed.load(Ordering::Relaxed),
            watched: state.last.len(),
            pending_remove: state.pending_remove.len(),
        }
    }
}
