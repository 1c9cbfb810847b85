//! Address lifecycle: watch-list reconciliation and the per-address
//! channel subscription managers.

pub mod address_loader;
pub mod order_sub;
pub mod position_sub;

pub use address_loader::AddressLoader;
pub use order_sub::OrderSubscriptionManager;
pub use position_sub::PositionManager;

use anyhow::Result;
use async_trait::async_trait;

/// Implemented by anything that needs channel subscriptions per watched
/// address. The loader fans lifecycle events out to every registered
/// subscriber; one subscriber failing never stops the sweep.
#[async_trait]
pub trait AddressSubscriber: Send + Sync {
    fn name(&self) -> &'static str;
    async fn subscribe_address(&self, address: &str) -> Result<()>;
    async fn unsubscribe_address(&self, address: &str) -> Result<()>;
}
