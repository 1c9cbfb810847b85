//! hl-monitor
//!
//! Watches a dynamic set of trader addresses on Hyperliquid over pooled
//! WebSocket subscriptions, aggregates their order fills into trade
//! signals, publishes the signals to NATS and persists aggregation state
//! to MySQL.

pub mod bus;
pub mod caches;
pub mod config;
pub mod health;
pub mod models;
pub mod monitor;
pub mod pipeline;
pub mod storage;
pub mod telemetry;
pub mod ws;
