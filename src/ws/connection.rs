//! Connection wrapper: one client plus the subscriptions bound to it

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::client::WsClient;
use super::Subscription;

/// Stateful facade over one `WsClient`. Owns the key -> subscription map
/// behind its own mutex; wrappers are replaced, never mutated, on reconnect.
pub struct ConnectionWrapper {
    id: u64,
    client: Arc<WsClient>,
    subs: Mutex<HashMap<String, Subscription>>,
}

impl ConnectionWrapper {
    pub fn new(id: u64, client: Arc<WsClient>) -> Arc<Self> {
        Arc::new(Self {
            id,
            client,
            subs: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> &Arc<WsClient> {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn add_subscription(&self, sub: Subscription) {
        self.subs.lock().insert(sub.key(), sub);
    }

    pub fn remove_subscription(&self, key: &str) {
        self.subs.lock().remove(key);
    }

    pub fn has_subscription(&self, key: &str) -> bool {
        self.subs.lock().contains_key(key)
    }

    /// Snapshot copy; the live map is never exposed.
    pub fn all_subscriptions(&self) -> Vec<Subscription> {
        self.subs.lock().values().cloned().collect()
    }
}
