//! Downstream signal bus
//!
//! The pipeline only knows the `SignalPublisher` seam; production wires a
//! NATS client behind it, tests wire recorders. Publish failures abort the
//! flush that produced them, so nothing here retries.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::NatsConfig;
use crate::models::Signal;

#[async_trait]
pub trait SignalPublisher: Send + Sync {
    async fn publish_address_signal(&self, signal: &Signal) -> Result<()>;
    fn is_connected(&self) -> bool;
}

pub struct NatsPublisher {
    client: async_nats::Client,
    subject: String,
}

impl NatsPublisher {
    pub async fn connect(cfg: &NatsConfig) -> Result<Self> {
        let client = async_nats::connect(&cfg.endpoint)
            .await
            .with_context(|| format!("Failed to connect to NATS at {}", cfg.endpoint))?;
        info!(endpoint = %cfg.endpoint, subject = %cfg.subject, "NATS publisher connected");
        Ok(Self {
            client,
            subject: cfg.subject.clone(),
        })
    }
}

#[async_trait]
impl SignalPublisher for NatsPublisher {
    async fn publish_address_signal(&self, signal: &Signal) -> Result<()> {
        let payload = serde_json::to_vec(signal).context("Failed to encode signal")?;
        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .context("NATS publish failed")?;
        debug!(
            address = %signal.address,
            symbol = %signal.symbol,
            direction = %signal.direction,
            "Signal published to bus"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}
