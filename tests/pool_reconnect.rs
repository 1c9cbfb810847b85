//! Pool behavior against an in-process WebSocket server: allocation,
//! fan-in, unsubscribe, severed-connection repair and migration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use hl_monitor::ws::dispatcher::DEFAULT_WORKERS;
use hl_monitor::ws::pool::{PoolConfig, SubscriptionTable};
use hl_monitor::ws::{Channel, Dispatcher, PoolManager, Subscription};

/// Minimal exchange stand-in. Records subscribe/unsubscribe frames per
/// accepted connection and can sever every live connection on demand.
struct WsServer {
    url: String,
    connections: Arc<AtomicUsize>,
    /// (connection seq, "subscribe"|"unsubscribe", "channel:user")
    frames: Arc<Mutex<Vec<(usize, String, String)>>>,
    kill: watch::Sender<u64>,
}

impl WsServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let frames: Arc<Mutex<Vec<(usize, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let (kill, _) = watch::channel(0u64);

        let conn_counter = connections.clone();
        let frame_log = frames.clone();
        let kill_tx = kill.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let seq = conn_counter.fetch_add(1, Ordering::SeqCst);
                let frame_log = frame_log.clone();
                let mut kill_rx = kill_tx.subscribe();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    loop {
                        tokio::select! {
                            msg = ws.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if let Ok(v) = serde_json::from_str::<Value>(&text) {
                                        let method = v["method"].as_str().unwrap_or_default();
                                        if method == "subscribe" || method == "unsubscribe" {
                                            let key = format!(
                                                "{}:{}",
                                                v["subscription"]["type"].as_str().unwrap_or_default(),
                                                v["subscription"]["user"].as_str().unwrap_or_default()
                                            );
                                            frame_log.lock().push((seq, method.to_string(), key));
                                        }
                                    }
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = ws.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => return,
                                Some(Ok(_)) => {}
                                Some(Err(_)) => return,
                            },
                            _ = kill_rx.changed() => {
                                // hard drop, no close handshake
                                return;
                            }
                        }
                    }
                });
            }
        });

        Self {
            url: format!("ws://{addr}"),
            connections,
            frames,
            kill,
        }
    }

    fn sever_all(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }

    fn subscribes_for(&self, key: &str) -> Vec<usize> {
        self.frames
            .lock()
            .iter()
            .filter(|(_, method, k)| method == "subscribe" && k == key)
            .map(|(seq, _, _)| *seq)
            .collect()
    }

    fn unsubscribes_for(&self, key: &str) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|(_, method, k)| method == "unsubscribe" && k == key)
            .count()
    }
}

fn pool_for(server: &WsServer, max_connections: usize, max_subs: usize) -> Arc<PoolManager> {
    let table: Arc<SubscriptionTable> = Arc::new(RwLock::new(HashMap::new()));
    let dispatcher = Dispatcher::new(table.clone(), DEFAULT_WORKERS);
    PoolManager::new(
        PoolConfig {
            ws_url: server.url.clone(),
            max_connections,
            max_subscriptions_per_connection: max_subs,
        },
        table,
        dispatcher,
    )
}

fn noop_callback() -> hl_monitor::ws::pool::FrameCallback {
    Arc::new(|_frame: &hl_monitor::models::RawFrame| {})
}

async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn subscribe_sends_one_wire_frame_per_key() {
    let server = WsServer::start().await;
    let pool = pool_for(&server, 2, 10);
    pool.start().await.unwrap();

    let sub = Subscription::new(Channel::UserFills, "0xa");
    let h1 = pool.subscribe(sub.clone(), noop_callback()).await.unwrap();
    let h2 = pool.subscribe(sub.clone(), noop_callback()).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            server.subscribes_for("userFills:0xa").len() == 1
        })
        .await,
        "exactly one wire subscribe for a fanned-in key"
    );
    assert_eq!(pool.stats().subscriptions, 1);

    // first unsubscribe keeps the wire subscription alive
    pool.unsubscribe(&h1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.unsubscribes_for("userFills:0xa"), 0);

    // the last callback out tears it down
    pool.unsubscribe(&h2).await;
    assert!(
        wait_until(Duration::from_secs(2), || {
            server.unsubscribes_for("userFills:0xa") == 1
        })
        .await
    );
    assert_eq!(pool.stats().subscriptions, 0);

    pool.close().await;
}

#[tokio::test]
async fn pool_grows_within_connection_cap() {
    let server = WsServer::start().await;
    // one subscription per connection forces growth
    let pool = pool_for(&server, 2, 1);
    pool.start().await.unwrap();

    pool.subscribe(Subscription::new(Channel::UserFills, "0xa"), noop_callback())
        .await
        .unwrap();
    pool.subscribe(Subscription::new(Channel::UserFills, "0xb"), noop_callback())
        .await
        .unwrap();
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);

    // cap reached: the third key degrades onto an existing connection
    pool.subscribe(Subscription::new(Channel::UserFills, "0xc"), noop_callback())
        .await
        .unwrap();
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().subscriptions, 3);

    pool.close().await;
}

#[tokio::test]
async fn severed_connection_migrates_subscriptions() {
    let server = WsServer::start().await;
    let pool = pool_for(&server, 2, 10);
    pool.start().await.unwrap();

    pool.subscribe(Subscription::new(Channel::UserFills, "0xa"), noop_callback())
        .await
        .unwrap();
    pool.subscribe(Subscription::new(Channel::UserFills, "0xb"), noop_callback())
        .await
        .unwrap();
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);

    server.sever_all();

    // repair runs behind jittered backoff (0.5-1.5s initial)
    assert!(
        wait_until(Duration::from_secs(10), || {
            server.subscribes_for("userFills:0xa").len() == 2
                && server.subscribes_for("userFills:0xb").len() == 2
        })
        .await,
        "both subscriptions resubscribed on the replacement connection"
    );

    // both landed on the same fresh connection, one subscribe each
    let conn_a = *server.subscribes_for("userFills:0xa").last().unwrap();
    let conn_b = *server.subscribes_for("userFills:0xb").last().unwrap();
    assert_eq!(conn_a, conn_b);
    assert!(conn_a >= 1);
    assert_eq!(pool.stats().subscriptions, 2);
    assert!(pool.stats().migrations >= 2);

    pool.close().await;
}

#[tokio::test]
async fn subscribe_during_repair_does_not_deadlock() {
    let server = WsServer::start().await;
    let pool = pool_for(&server, 2, 10);
    pool.start().await.unwrap();

    pool.subscribe(Subscription::new(Channel::UserFills, "0xa"), noop_callback())
        .await
        .unwrap();

    server.sever_all();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // a subscribe racing the repair must complete, not deadlock
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        pool.subscribe(Subscription::new(Channel::WebData2, "0xc"), noop_callback()),
    )
    .await;
    assert!(result.is_ok(), "subscribe timed out during repair");

    assert!(
        wait_until(Duration::from_secs(10), || {
            server.subscribes_for("userFills:0xa").len() == 2
        })
        .await
    );

    pool.close().await;
}
