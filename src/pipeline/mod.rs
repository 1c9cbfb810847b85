//! Processing pipeline: message queue, TTL dedup layers, the order
//! aggregation engine and the position snapshot processor.

pub mod dedup;
pub mod order_processor;
pub mod position_processor;
pub mod queue;
pub mod status_tracker;

pub use dedup::DedupCache;
pub use order_processor::{FlushTrigger, OrderProcessor};
pub use position_processor::PositionProcessor;
pub use queue::{MessageHandler, MessageQueue, MonitorMessage};
pub use status_tracker::OrderStatusTracker;
