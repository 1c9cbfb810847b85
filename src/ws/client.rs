//! Single WebSocket connection with read/write pumps and heartbeats
//!
//! One `WsClient` owns one TCP/WSS stream. Writes are serialized behind an
//! async mutex with a hard deadline; the read pump enforces a read deadline
//! that any inbound traffic (including PONGs) resets. The disconnect
//! callback fires exactly once per connection, on its own task, so pool
//! repair never runs on the read pump.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::Subscription;
use crate::models::RawFrame;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = SplitSink<WsStream, Message>;

pub type MessageHandler = Arc<dyn Fn(RawFrame) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(50);

pub struct WsClient {
    url: String,
    writer: tokio::sync::Mutex<Option<Writer>>,
    connected: AtomicBool,
    closed: AtomicBool,
    disconnect_fired: AtomicBool,
    message_handler: RwLock<Option<MessageHandler>>,
    disconnect_cb: RwLock<Option<DisconnectCallback>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    weak: Weak<WsClient>,
}

impl WsClient {
    pub fn new(url: &str) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            url: url.to_string(),
            writer: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            disconnect_fired: AtomicBool::new(true), // nothing to fire before first connect
            message_handler: RwLock::new(None),
            disconnect_cb: RwLock::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
            weak: weak.clone(),
        })
    }

    /// Register the single inbound frame callback. Must be set before
    /// `connect` for frames not to be dropped.
    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.message_handler.write() = Some(handler);
    }

    /// Register the disconnect callback. Fires once per connection, on a
    /// separate task.
    pub fn set_disconnect_callback(&self, cb: DisconnectCallback) {
        *self.disconnect_cb.write() = Some(cb);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Open the connection and start the pumps. Idempotent while connected;
    /// retryable on the same client after a disconnect.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let me = self.weak.upgrade().context("Client dropped")?;

        // Stale pumps from a previous connection must not outlive this one.
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let (stream, resp) = timeout(HANDSHAKE_TIMEOUT, connect_async(&self.url))
            .await
            .context("WebSocket handshake timed out")?
            .context("WebSocket handshake failed")?;

        debug!(url = %self.url, status = %resp.status(), "WebSocket connected");

        let (write, read) = stream.split();
        *self.writer.lock().await = Some(write);

        self.closed.store(false, Ordering::Release);
        self.disconnect_fired.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);

        let mut tasks = self.tasks.lock();

        let reader = Arc::clone(&me);
        tasks.push(tokio::spawn(async move {
            reader.read_pump(read).await;
        }));

        tasks.push(tokio::spawn(async move {
            me.heartbeat_loop().await;
        }));

        Ok(())
    }

    /// Send a subscribe frame for `sub`.
    pub async fn subscribe(&self, sub: &Subscription) -> Result<()> {
        let frame = json!({ "method": "subscribe", "subscription": sub.payload() });
        self.send_raw(Message::Text(frame.to_string()))
            .await
            .with_context(|| format!("Failed to subscribe {}", sub.key()))
    }

    /// Send an unsubscribe frame for `sub`.
    pub async fn unsubscribe(&self, sub: &Subscription) -> Result<()> {
        let frame = json!({ "method": "unsubscribe", "subscription": sub.payload() });
        self.send_raw(Message::Text(frame.to_string()))
            .await
            .with_context(|| format!("Failed to unsubscribe {}", sub.key()))
    }

    /// Close the socket and cancel the pumps. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);

        {
            let mut guard = self.writer.lock().await;
            if let Some(mut writer) = guard.take() {
                let _ = timeout(Duration::from_secs(2), writer.send(Message::Close(None))).await;
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        self.fire_disconnect();
    }

    async fn send_raw(&self, msg: Message) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().context("Not connected")?;
        timeout(WRITE_DEADLINE, writer.send(msg))
            .await
            .context("Write deadline exceeded")?
            .context("Write failed")?;
        Ok(())
    }

    async fn read_pump(self: Arc<Self>, mut read: SplitStream<WsStream>) {
        loop {
            let msg = match timeout(READ_DEADLINE, read.next()).await {
                Err(_) => {
                    warn!(url = %self.url, "Read deadline exceeded, closing connection");
                    break;
                }
                Ok(None) => {
                    debug!(url = %self.url, "WebSocket stream ended");
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!(url = %self.url, error = %e, "WebSocket read error");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Text(text) => match serde_json::from_str::<RawFrame>(&text) {
                    Ok(frame) => {
                        let handler = self.message_handler.read().clone();
                        if let Some(handler) = handler {
                            handler(frame);
                        }
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            raw = &text[..text.len().min(200)],
                            "Dropping undecodable frame"
                        );
                        metrics::counter!("ws_decode_errors_total", 1);
                    }
                },
                Message::Ping(data) => {
                    if let Err(e) = self.send_raw(Message::Pong(data)).await {
                        warn!(error = %e, "Failed to answer PING");
                        break;
                    }
                }
                Message::Pong(_) => {
                    trace!("PONG received");
                }
                Message::Close(frame) => {
                    debug!(?frame, "Close frame received");
                    break;
                }
                _ => {}
            }
        }

        self.connected.store(false, Ordering::Release);
        self.fire_disconnect();
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately; skip it so the heartbeat
        // starts one full interval after connect
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if !self.is_connected() {
                return;
            }
            let ping = json!({ "method": "ping" }).to_string();
            if let Err(e) = self.send_raw(Message::Text(ping)).await {
                warn!(error = %e, "Heartbeat write failed");
                return;
            }
            if let Err(e) = self.send_raw(Message::Ping(Vec::new())).await {
                warn!(error = %e, "Protocol PING failed");
                return;
            }
        }
    }

    fn fire_disconnect(&self) {
        if self.disconnect_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let cb = self.disconnect_cb.read().clone();
        if let Some(cb) = cb {
            tokio::spawn(async move {
                cb();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::Channel;

    #[test]
    fn test_subscribe_frame_shape() {
        let sub = Subscription::new(Channel::UserFills, "0xAB");
        let frame = json!({ "method": "subscribe", "subscription": sub.payload() });
        let text = frame.to_string();
        assert!(text.contains(r#""method":"subscribe""#));
        assert!(text.contains(r#""type":"userFills""#));
        assert!(text.contains(r#""user":"0xab""#));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = WsClient::new("wss://example.invalid/ws");
        client.close().await;
        client.close().await;
        assert!(!client.is_connected());
    }
}
