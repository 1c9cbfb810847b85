//! WebSocket layer: single-socket client, connection wrapper, pool and
//! frame dispatcher.

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod pool;

pub use client::WsClient;
pub use connection::ConnectionWrapper;
pub use dispatcher::Dispatcher;
pub use pool::{PoolManager, SubscriptionHandle};

use serde_json::json;

/// The three user-bound channels the monitor consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    UserFills,
    OrderUpdates,
    WebData2,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::UserFills, Channel::OrderUpdates, Channel::WebData2];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::UserFills => "userFills",
            Channel::OrderUpdates => "orderUpdates",
            Channel::WebData2 => "webData2",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One server-side subscription: a channel bound to a user address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub channel: Channel,
    pub user: String,
}

impl Subscription {
    /// Addresses are normalized to lowercase so keys and frame routing agree.
    pub fn new(channel: Channel, user: &str) -> Self {
        Self {
            channel,
            user: user.to_lowercase(),
        }
    }

    /// Unique key: `channel:address`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.channel.as_str(), self.user)
    }

    /// The `subscription` object of the outbound subscribe/unsubscribe frame.
    pub fn payload(&self) -> serde_json::Value {
        json!({ "type": self.channel.as_str(), "user": self.user })
    }
}
