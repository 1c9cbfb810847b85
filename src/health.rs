//! Health and status HTTP endpoints
//!
//! /health and /health/live are liveness probes, /health/ready gates on the
//! pool and the bus, /metrics renders the Prometheus registry and /status
//! returns JSON snapshots of component stats (always copies, never live
//! maps).

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::bus::SignalPublisher;
use crate::caches::{PositionBalanceCache, SymbolCache};
use crate::monitor::AddressLoader;
use crate::pipeline::OrderProcessor;
use crate::storage::BatchWriter;
use crate::ws::{Dispatcher, PoolManager};

#[derive(Clone)]
pub struct HealthState {
    pub started_at: Instant,
    pub prometheus: PrometheusHandle,
    pub pool: Arc<PoolManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub publisher: Arc<dyn SignalPublisher>,
    pub processor: Arc<OrderProcessor>,
    pub batch_writer: Arc<BatchWriter>,
    pub loader: Arc<AddressLoader>,
    pub balances: Arc<PositionBalanceCache>,
    pub symbols: Arc<SymbolCache>,
}

pub async fn serve(addr: &str, state: HealthState) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/health/live", get(live))
        .route("/metrics", get(metrics_text))
        .route("/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health server to {addr}"))?;
    info!(addr, "Health server listening");
    axum::serve(listener, app)
        .await
        .context("Health server exited")?;
    Ok(())
}

async fn health(State(state): State<HealthState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn live() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let websocket = state.pool.is_connected();
    let bus = state.publisher.is_connected();
    let ready = websocket && bus;
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({ "ready": ready, "websocket": websocket, "bus": bus })))
}

async fn metrics_text(State(state): State<HealthState>) -> String {
    state.prometheus.render()
}

async fn status(State(state): State<HealthState>) -> Json<Value> {
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "pool": state.pool.stats(),
        "dispatcher": state.dispatcher.stats(),
        "processor": state.processor.stats(),
        "batch_writer": state.batch_writer.stats(),
        "address_loader": state.loader.stats().await,
        "balance_cache_entries": state.balances.len(),
        "symbols": {
            "spot": state.symbols.spot_len(),
            "perp": state.symbols.perp_len(),
        },
    }))
}
