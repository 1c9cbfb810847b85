//! Address loader reconciliation: grace-window semantics against a mock
//! watch table and a recording subscriber.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use hl_monitor::models::{OrderAggregationRow, PositionRecord, Signal};
use hl_monitor::monitor::{AddressLoader, AddressSubscriber};
use hl_monitor::storage::MonitorStorage;

#[derive(Default)]
struct MockWatchTable {
    addresses: Mutex<Vec<String>>,
}

impl MockWatchTable {
    fn set(&self, addrs: &[&str]) {
        *self.addresses.lock() = addrs.iter().map(|s| s.to_string()).collect();
    }
}

#[async_trait]
impl MonitorStorage for MockWatchTable {
    async fn list_active_addresses(&self) -> Result<Vec<String>> {
        Ok(self.addresses.lock().clone())
    }
    async fn get_sent_orders_since(&self, _since: DateTime<Utc>) -> Result<Vec<OrderAggregationRow>> {
        Ok(Vec::new())
    }
    async fn batch_upsert_order_aggregations(&self, _rows: &[OrderAggregationRow]) -> Result<()> {
        Ok(())
    }
    async fn batch_upsert_position_cache(&self, _rows: &[PositionRecord]) -> Result<()> {
        Ok(())
    }
    async fn create_signal(&self, _signal: &Signal) -> Result<()> {
        Ok(())
    }
    async fn delete_aggregations_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }
    async fn delete_signals_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }
}

#[derive(Default)]
struct RecordingSubscriber {
    subscribes: Mutex<Vec<String>>,
    unsubscribes: Mutex<Vec<String>>,
    fail_subscribes: Mutex<bool>,
}

#[async_trait]
impl AddressSubscriber for RecordingSubscriber {
    fn name(&self) -> &'static str {
        "recording"
    }
    async fn subscribe_address(&self, address: &str) -> Result<()> {
        if *self.fail_subscribes.lock() {
            return Err(anyhow!("subscribe refused"));
        }
        self.subscribes.lock().push(address.to_string());
        Ok(())
    }
    async fn unsubscribe_address(&self, address: &str) -> Result<()> {
        self.unsubscribes.lock().push(address.to_string());
        Ok(())
    }
}

fn setup(grace: Duration) -> (Arc<MockWatchTable>, Arc<RecordingSubscriber>, Arc<AddressLoader>) {
    let table = Arc::new(MockWatchTable::default());
    let subscriber = Arc::new(RecordingSubscriber::default());
    let loader = AddressLoader::new(table.clone(), Duration::from_secs(300), grace);
    loader.register(subscriber.clone());
    (table, subscriber, loader)
}

#[tokio::test]
async fn discovered_addresses_are_subscribed_once() {
    let (table, subscriber, loader) = setup(Duration::from_secs(600));

    table.set(&["0xA", "0xB"]);
    loader.reconcile_now().await.unwrap();
    // already-known addresses do not resubscribe
    loader.reconcile_now().await.unwrap();

    let mut subs = subscriber.subscribes.lock().clone();
    subs.sort();
    assert_eq!(subs, vec!["0xa", "0xb"]);

    let stats = loader.stats().await;
    assert_eq!(stats.watched, 2);
    assert_eq!(stats.pending_remove, 0);
}

#[tokio::test]
async fn reappearing_address_inside_grace_costs_nothing() {
    let (table, subscriber, loader) = setup(Duration::from_secs(600));

    table.set(&["0xb"]);
    loader.reconcile_now().await.unwrap();
    assert_eq!(subscriber.subscribes.lock().len(), 1);

    // source table flaps: the address disappears...
    table.set(&[]);
    loader.reconcile_now().await.unwrap();
    assert_eq!(loader.stats().await.pending_remove, 1);
    assert!(subscriber.unsubscribes.lock().is_empty());

    // ...and reappears well inside the grace window
    table.set(&["0xb"]);
    loader.reconcile_now().await.unwrap();

    // neither an unsubscribe nor a duplicate subscribe happened
    assert!(subscriber.unsubscribes.lock().is_empty());
    assert_eq!(subscriber.subscribes.lock().len(), 1);
    assert_eq!(loader.stats().await.pending_remove, 0);
}

#[tokio::test]
async fn grace_expiry_unsubscribes() {
    let (table, subscriber, loader) = setup(Duration::from_millis(150));

    table.set(&["0xc"]);
    loader.reconcile_now().await.unwrap();

    table.set(&[]);
    loader.reconcile_now().await.unwrap();
    assert!(subscriber.unsubscribes.lock().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    loader.reconcile_now().await.unwrap();

    assert_eq!(subscriber.unsubscribes.lock().clone(), vec!["0xc"]);
    let stats = loader.stats().await;
    assert_eq!(stats.watched, 0);
    assert_eq!(stats.pending_remove, 0);
}

#[tokio::test]
async fn subscriber_failure_does_not_abort_the_sweep() {
    let (table, subscriber, loader) = setup(Duration::from_secs(600));
    *subscriber.fail_subscribes.lock() = true;

    table.set(&["0xd", "0xe"]);
    loader.reconcile_now().await.unwrap();

    // the sweep completed and the loader still tracks both addresses
    let stats = loader.stats().await;
    assert_eq!(stats.watched, 2);
    assert!(subscriber.subscribes.lock().is_empty());
}
