//! Frame dispatcher: routes decoded frames to subscription callbacks
//!
//! One dispatcher sits behind every client in the pool. Routing is by
//! `channel:user`; payloads without a `user` field broadcast to every
//! subscription on that channel. Callbacks run on a bounded worker pool;
//! when the pool is saturated they run synchronously on the read pump,
//! which throttles the producer through socket flow control.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

use super::pool::{FrameCallback, SubscriptionTable};
use crate::models::RawFrame;

pub const DEFAULT_WORKERS: usize = 1_000;

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub frames_routed: u64,
    pub frames_unrouted: u64,
    pub overflow_synchronous: u64,
    /// Snapshot copy; callers own the returned map.
    pub messages_per_address: HashMap<String, u64>,
}

pub struct Dispatcher {
    subscriptions: Arc<SubscriptionTable>,
    workers: Arc<Semaphore>,
    frames_routed: AtomicU64,
    frames_unrouted: AtomicU64,
    overflow_synchronous: AtomicU64,
    messages_per_address: RwLock<HashMap<String, u64>>,
}

impl Dispatcher {
    pub fn new(subscriptions: Arc<SubscriptionTable>, workers: usize) -> Arc<Self> {
        Arc::new(Self {
            subscriptions,
            workers: Arc::new(Semaphore::new(workers)),
            frames_routed: AtomicU64::new(0),
            frames_unrouted: AtomicU64::new(0),
            overflow_synchronous: AtomicU64::new(0),
            messages_per_address: RwLock::new(HashMap::new()),
        })
    }

    /// Route one decoded frame. Called from a read pump; must never block on
    /// downstream locks held across I/O.
    pub fn dispatch(&self, frame: RawFrame) {
        match frame.channel.as_str() {
            "subscriptionResponse" => {
                trace!("Subscription acknowledged");
                return;
            }
            "pong" => {
                trace!("Application-level pong");
                return;
            }
            "error" => {
                warn!(data = %frame.data, "Server error frame");
                return;
            }
            _ => {}
        }

        let user = frame
            .data
            .get("user")
            .and_then(|v| v.as_str())
            .map(|s| s.to_lowercase());

        // Snapshot the callback set under the read lock, invoke after release.
        let callbacks: Vec<FrameCallback> = {
            let table = self.subscriptions.read();
            match &user {
                Some(user) => {
                    let key = format!("{}:{}", frame.channel, user);
                    table
                        .get(&key)
                        .map(|info| info.callbacks.values().cloned().collect())
                        .unwrap_or_default()
                }
                None => {
                    let prefix = format!("{}:", frame.channel);
                    table
                        .iter()
                        .filter(|(key, _)| key.starts_with(&prefix))
                        .flat_map(|(_, info)| info.callbacks.values().cloned())
                        .collect()
                }
            }
        };

        if callbacks.is_empty() {
            debug!(channel = %frame.channel, "Frame with no registered route");
            self.frames_unrouted.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.frames_routed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dispatcher_frames_total", 1, "channel" => frame.channel.clone());
        if let Some(user) = &user {
            *self
                .messages_per_address
                .write()
                .entry(user.clone())
                .or_insert(0) += 1;
        }

        let frame = Arc::new(frame);
        for cb in callbacks {
            match self.workers.clone().try_acquire_owned() {
                Ok(permit) => {
                    let frame = Arc::clone(&frame);
                    tokio::spawn(async move {
                        cb(&frame);
                        drop(permit);
                    });
                }
                Err(_) => {
                    // worker pool saturated: degrade to the read pump
                    self.overflow_synchronous.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("dispatcher_overflow_sync_total", 1);
                    cb(&frame);
                }
            }
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            frames_routed: self.frames_routed.load(Ordering::Relaxed),
            frames_unrouted: self.frames_unrouted.load(Ordering::Relaxed),
            overflow_synchronous: self.overflow_synchronous.load(Ordering::Relaxed),
            messages_per_address: self.messages_per_address.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::pool::SubscriptionInfo;
    use crate::ws::{Channel, ConnectionWrapper, Subscription, WsClient};
    use parking_lot::Mutex;
    use serde_json::json;

    fn table_with(
        sub: Subscription,
        cb: FrameCallback,
    ) -> Arc<SubscriptionTable> {
        let table: Arc<SubscriptionTable> = Arc::new(RwLock::new(HashMap::new()));
        let wrapper = ConnectionWrapper::new(1, WsClient::new("wss://example.invalid/ws"));
        let mut callbacks = HashMap::new();
        callbacks.insert(1u64, cb);
        table.write().insert(
            sub.key(),
            SubscriptionInfo {
                subscription: sub,
                callbacks,
                connection: wrapper,
            },
        );
        table
    }

    #[tokio::test]
    async fn test_routes_by_channel_and_user() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let sub = Subscription::new(Channel::UserFills, "0xAA");
        let table = table_with(
            sub,
            Arc::new(move |frame| {
                seen_cb.lock().push(frame.channel.clone());
            }),
        );
        let dispatcher = Dispatcher::new(table, 4);

        // matching user (case-insensitive) routes
        dispatcher.dispatch(RawFrame {
            channel: "userFills".to_string(),
            data: json!({ "user": "0xAA", "fills": [] }),
        });
        // wrong user does not
        dispatcher.dispatch(RawFrame {
            channel: "userFills".to_string(),
            data: json!({ "user": "0xBB", "fills": [] }),
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(seen.lock().len(), 1);
        let stats = dispatcher.stats();
        assert_eq!(stats.frames_routed, 1);
        assert_eq!(stats.frames_unrouted, 1);
        assert_eq!(stats.messages_per_address.get("0xaa"), Some(&1));
    }

    #[tokio::test]
    async fn test_broadcast_when_user_missing() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let sub = Subscription::new(Channel::OrderUpdates, "0xaa");
        let table = table_with(
            sub,
            Arc::new(move |frame| {
                seen_cb.lock().push(frame.channel.clone());
            }),
        );
        let dispatcher = Dispatcher::new(table, 4);

        // orderUpdates payloads are arrays: no user field, broadcast
        dispatcher.dispatch(RawFrame {
            channel: "orderUpdates".to_string(),
            data: json!([{ "order": { "oid": 5 }, "status": "filled" }]),
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_overflow_degrades_to_synchronous() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let sub = Subscription::new(Channel::UserFills, "0xaa");
        let table = table_with(
            sub,
            Arc::new(move |frame| {
                seen_cb.lock().push(frame.channel.clone());
            }),
        );
        // zero workers: every dispatch takes the synchronous path
        let dispatcher = Dispatcher::new(table, 0);

        dispatcher.dispatch(RawFrame {
            channel: "userFills".to_string(),
            data: json!({ "user": "0xaa", "fills": [] }),
        });

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(dispatcher.stats().overflow_synchronous, 1);
    }
}
