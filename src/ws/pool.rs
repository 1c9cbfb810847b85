//! Connection pool: subscription allocation, reconnect and migration
//!
//! The pool owns N connection wrappers and a subscription table shared with
//! the dispatcher. Allocation is first-fit with capacity, then grow, then
//! degrade to least-loaded. Repair collapses concurrent disconnect storms
//! behind a try-locked mutex, replaces dead wrappers in place and migrates
//! their subscriptions to the replacements.
//!
//! Lock discipline: `connections` and `subscriptions` are never held across
//! network I/O. Nothing here acquires both at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::client::WsClient;
use super::connection::ConnectionWrapper;
use super::dispatcher::Dispatcher;
use super::Subscription;
use crate::models::RawFrame;

const BACKOFF_INITIAL_MS: u64 = 1_000;
const BACKOFF_MAX_MS: u64 = 300_000;

pub type FrameCallback = Arc<dyn Fn(&RawFrame) + Send + Sync>;

/// One registered subscription: the wire subscription, its fan-in callback
/// set, and the wrapper currently carrying it.
pub struct SubscriptionInfo {
    pub subscription: Subscription,
    pub callbacks: HashMap<u64, FrameCallback>,
    pub connection: Arc<ConnectionWrapper>,
}

/// Shared between the pool (writes) and the dispatcher (reads).
pub type SubscriptionTable = RwLock<HashMap<String, SubscriptionInfo>>;

/// Returned by `subscribe`; needed to unsubscribe this caller's callback.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub key: String,
    pub id: u64,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub ws_url: String,
    pub max_connections: usize,
    pub max_subscriptions_per_connection: usize,
}

#[derive(Default)]
struct PoolMetrics {
    reconnects: AtomicU64,
    migrations: AtomicU64,
    subscribes: AtomicU64,
    unsubscribes: AtomicU64,
}

/// Snapshot for /status; never hands out live maps.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub connections: usize,
    pub connected: usize,
    pub subscriptions: usize,
    pub reconnects: u64,
    pub migrations: u64,
    pub subscribes: u64,
    pub unsubscribes: u64,
}

pub struct PoolManager {
    config: PoolConfig,
    connections: RwLock<Vec<Arc<ConnectionWrapper>>>,
    subscriptions: Arc<SubscriptionTable>,
    dispatcher: Arc<Dispatcher>,
    reconnect_lock: tokio::sync::Mutex<()>,
    backoff_ms: AtomicU64,
    next_handle_id: AtomicU64,
    next_conn_id: AtomicU64,
    shutdown: AtomicBool,
    metrics: PoolMetrics,
    weak: Weak<PoolManager>,
}

impl PoolManager {
    pub fn new(
        config: PoolConfig,
        subscriptions: Arc<SubscriptionTable>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            connections: RwLock::new(Vec::new()),
            subscriptions,
            dispatcher,
            reconnect_lock: tokio::sync::Mutex::new(()),
            backoff_ms: AtomicU64::new(BACKOFF_INITIAL_MS),
            next_handle_id: AtomicU64::new(0),
            next_conn_id: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            metrics: PoolMetrics::default(),
            weak: weak.clone(),
        })
    }

    /// Open the first connection; returns only after its handshake.
    pub async fn start(&self) -> Result<()> {
        let wrapper = self.new_connection().await?;
        self.connections.write().push(wrapper);
        info!(url = %self.config.ws_url, "Connection pool started");
        Ok(())
    }

    /// Attach `cb` to the subscription for `sub`. The server-side subscribe
    /// is sent only for the first callback on a key; later callers fan in.
    pub async fn subscribe(
        &self,
        sub: Subscription,
        cb: FrameCallback,
    ) -> Result<SubscriptionHandle> {
        let key = sub.key();
        let handle_id = self.next_handle_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = SubscriptionHandle {
            key: key.clone(),
            id: handle_id,
        };

        // Fan-in fast path: the key is already live.
        {
            let mut table = self.subscriptions.write();
            if let Some(info) = table.get_mut(&key) {
                info.callbacks.insert(handle_id, cb);
                return Ok(handle);
            }
        }

        // Connection acquisition may open a socket; no locks held.
        let conn = self.acquire_connection().await?;

        // Register before the network subscribe so inbound frames racing the
        // subscribe ack already have a route.
        {
            let mut table = self.subscriptions.write();
            if let Some(info) = table.get_mut(&key) {
                // lost the race to a concurrent subscriber; fan in
                info.callbacks.insert(handle_id, cb);
                return Ok(handle);
            }
            let mut callbacks = HashMap::new();
            callbacks.insert(handle_id, cb);
            table.insert(
                key.clone(),
                SubscriptionInfo {
                    subscription: sub.clone(),
                    callbacks,
                    connection: conn.clone(),
                },
            );
        }
        conn.add_subscription(sub.clone());

        if let Err(e) = conn.client().subscribe(&sub).await {
            // roll back the registration; the caller sees the error
            self.subscriptions.write().remove(&key);
            conn.remove_subscription(&key);
            return Err(e);
        }

        self.metrics.subscribes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pool_subscribes_total", 1);
        Ok(handle)
    }

    /// Detach one callback; the last one out tears down the server-side
    /// subscription.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let removed = {
            let mut table = self.subscriptions.write();
            let Some(info) = table.get_mut(&handle.key) else {
                return;
            };
            info.callbacks.remove(&handle.id);
            if info.callbacks.is_empty() {
                table
                    .remove(&handle.key)
                    .map(|info| (info.subscription, info.connection))
            } else {
                None
            }
        };

        // Network unsubscribe happens outside the table lock.
        if let Some((sub, conn)) = removed {
            conn.remove_subscription(&handle.key);
            if let Err(e) = conn.client().unsubscribe(&sub).await {
                warn!(key = %handle.key, error = %e, "Server-side unsubscribe failed");
            }
            self.metrics.unsubscribes.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("pool_unsubscribes_total", 1);
        }
    }

    /// Tear down every wrapper.
    pub async fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        let wrappers: Vec<_> = self.connections.read().clone();
        for wrapper in wrappers {
            wrapper.client().close().await;
        }
        self.connections.write().clear();
        self.subscriptions.write().clear();
        info!("Connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let (connections, connected) = {
            let conns = self.connections.read();
            let connected = conns.iter().filter(|w| w.is_connected()).count();
            (conns.len(), connected)
        };
        PoolStats {
            connections,
            connected,
            subscriptions: self.subscriptions.read().len(),
            reconnects: self.metrics.reconnects.load(Ordering::Relaxed),
            migrations: self.metrics.migrations.load(Ordering::Relaxed),
            subscribes: self.metrics.subscribes.load(Ordering::Relaxed),
            unsubscribes: self.metrics.unsubscribes.load(Ordering::Relaxed),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connections.read().iter().any(|w| w.is_connected())
    }

    async fn new_connection(&self) -> Result<Arc<ConnectionWrapper>> {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let client = WsClient::new(&self.config.ws_url);

        let dispatcher = self.dispatcher.clone();
        client.set_message_handler(Arc::new(move |frame| dispatcher.dispatch(frame)));

        let pool = self.weak.clone();
        client.set_disconnect_callback(Arc::new(move || {
            if let Some(pool) = pool.upgrade() {
                pool.on_disconnect();
            }
        }));

        client
            .connect()
            .await
            .with_context(|| format!("Failed to open pool connection #{id}"))?;
        Ok(ConnectionWrapper::new(id, client))
    }

    /// First connected wrapper with spare capacity; grow the pool if none
    /// and we are under the cap; otherwise degrade to the least loaded.
    async fn acquire_connection(&self) -> Result<Arc<ConnectionWrapper>> {
        if let Some(conn) = self.first_fit() {
            return Ok(conn);
        }

        let may_grow = self.connections.read().len() < self.config.max_connections;
        if may_grow {
            let wrapper = self.new_connection().await?;
            self.connections.write().push(wrapper.clone());
            debug!(id = wrapper.id(), "Pool grew by one connection");
            return Ok(wrapper);
        }

        self.least_loaded()
            .context("No connected WebSocket available for subscription")
    }

    fn first_fit(&self) -> Option<Arc<ConnectionWrapper>> {
        self.connections
            .read()
            .iter()
            .find(|w| {
                w.is_connected()
                    && w.subscription_count() < self.config.max_subscriptions_per_connection
            })
            .cloned()
    }

    fn least_loaded(&self) -> Option<Arc<ConnectionWrapper>> {
        self.connections
            .read()
            .iter()
            .filter(|w| w.is_connected())
            .min_by_key(|w| w.subscription_count())
            .cloned()
    }

    fn on_disconnect(&self) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let Some(pool) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            pool.repair_loop().await;
        });
    }

    /// One repair attempt per backoff step until the pool is whole again.
    /// Concurrent disconnects collapse into the run already holding the lock.
    async fn repair_loop(self: Arc<Self>) {
        let Ok(_guard) = self.reconnect_lock.try_lock() else {
            debug!("Repair already in progress, collapsing");
            return;
        };

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }

            let base = self.backoff_ms.load(Ordering::Relaxed);
            let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
            let delay = Duration::from_millis((base as f64 * jitter) as u64);
            debug!(delay_ms = delay.as_millis() as u64, "Repair backoff");
            tokio::time::sleep(delay).await;

            match self.repair_connections().await {
                Ok(()) => {
                    // a disconnect collapsed into this run may have landed
                    // after the snapshot; run another pass for it
                    if self.connections.read().iter().any(|w| !w.is_connected()) {
                        debug!("Connection died during repair, running another pass");
                        continue;
                    }
                    self.backoff_ms.store(BACKOFF_INITIAL_MS, Ordering::Relaxed);
                    self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("pool_reconnects_total", 1);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms = base, "Connection repair failed, will retry");
                    self.backoff_ms
                        .store((base * 2).min(BACKOFF_MAX_MS), Ordering::Relaxed);
                }
            }
        }
    }

    /// Replace every dead wrapper and migrate its subscriptions. Any failure
    /// aborts the whole repair; the loop retries with increased backoff.
    async fn repair_connections(&self) -> Result<()> {
        let snapshot: Vec<_> = self.connections.read().clone();
        let mut repaired = 0usize;

        for old in snapshot {
            if old.is_connected() {
                continue;
            }

            old.client().close().await;
            let fresh = self.new_connection().await?;

            // Swap in place so allocation order stays stable.
            {
                let mut conns = self.connections.write();
                match conns.iter_mut().find(|w| w.id() == old.id()) {
                    Some(slot) => *slot = fresh.clone(),
                    None => conns.push(fresh.clone()),
                }
            }

            if let Err(e) = self.migrate_subscriptions(&old, &fresh).await {
                // Everything is already repointed at `fresh`; closing it makes
                // the next pass pick all of it up again.
                fresh.client().close().await;
                return Err(e);
            }
            repaired += 1;
        }

        if repaired > 0 {
            info!(repaired, "Connection repair complete");
        }
        Ok(())
    }

    async fn migrate_subscriptions(
        &self,
        old: &Arc<ConnectionWrapper>,
        fresh: &Arc<ConnectionWrapper>,
    ) -> Result<()> {
        // Repoint first: map-only, cannot fail, so a later subscribe error
        // leaves every affected key attached to `fresh`.
        let mut to_resubscribe = Vec::new();
        {
            let mut table = self.subscriptions.write();
            for sub in old.all_subscriptions() {
                if let Some(info) = table.get_mut(&sub.key()) {
                    if info.connection.id() == old.id() {
                        info.connection = fresh.clone();
                        to_resubscribe.push(sub);
                    }
                }
            }
        }
        for sub in &to_resubscribe {
            fresh.add_subscription(sub.clone());
        }

        // Server-side resubscribes, outside all locks.
        for sub in &to_resubscribe {
            fresh
                .client()
                .subscribe(sub)
                .await
                .with_context(|| format!("Failed to migrate subscription {}", sub.key()))?;
            self.metrics.migrations.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("pool_migrations_total", 1);
        }

        if !to_resubscribe.is_empty() {
            info!(
                count = to_resubscribe.len(),
                from = old.id(),
                to = fresh.id(),
                "Migrated subscriptions to replacement connection"
            );
        }
        Ok(())
    }
}
