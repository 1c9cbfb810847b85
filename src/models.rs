//! Wire payloads and domain types
//!
//! Wire structs mirror the exchange's JSON shapes (camelCase, decimal
//! fields as strings). Domain types keep the raw decimal strings and parse
//! to f64 only where arithmetic needs them.

use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// Inbound frame envelope
// ============================================================================

/// Every inbound WebSocket frame: `{ "channel": "...", "data": ... }`
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    pub channel: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ============================================================================
// userFills payload
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFillsData {
    pub user: String,
    #[serde(default)]
    pub is_snapshot: bool,
    pub fills: Vec<WsFill>,
}

/// A single fill as the exchange reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsFill {
    pub coin: String,
    pub px: String, // decimal string
    pub sz: String, // decimal string
    pub side: String, // "B" or "A"
    pub time: i64,  // ms
    #[serde(default)]
    pub start_position: String,
    pub dir: String, // "Open Long", "Close Short", "Buy", "Long > Short", ...
    pub oid: u64,
    pub tid: u64,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub fee: String,
    #[serde(default)]
    pub closed_pnl: String,
}

// ============================================================================
// orderUpdates payload
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsOrderUpdate {
    pub order: WsOrder,
    pub status: String, // "open", "filled", "canceled", "triggered", "rejected", ...
    #[serde(default)]
    pub status_timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsOrder {
    pub coin: String,
    pub side: String,
    #[serde(default)]
    pub limit_px: String,
    pub sz: String,
    pub oid: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub orig_sz: String,
}

// ============================================================================
// webData2 payload (account snapshot)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebData2 {
    #[serde(default)]
    pub user: String,
    pub clearinghouse_state: ClearinghouseState,
    #[serde(default)]
    pub spot_state: Option<SpotState>,
    #[serde(default)]
    pub spot_asset_ctxs: Vec<SpotAssetCtx>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearinghouseState {
    pub margin_summary: MarginSummary,
    #[serde(default)]
    pub cross_margin_summary: Option<MarginSummary>,
    #[serde(default)]
    pub asset_positions: Vec<AssetPosition>,
    #[serde(default)]
    pub time: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginSummary {
    pub account_value: String,
    #[serde(default)]
    pub total_ntl_pos: String,
    #[serde(default)]
    pub total_margin_used: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPosition {
    pub position: PerpPosition,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerpPosition {
    pub coin: String,
    pub szi: String, // signed size, decimal string
    #[serde(default)]
    pub entry_px: Option<String>,
    #[serde(default)]
    pub position_value: String,
    #[serde(default)]
    pub unrealized_pnl: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotState {
    #[serde(default)]
    pub balances: Vec<SpotBalance>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotBalance {
    pub coin: String,
    pub total: String,
    #[serde(default)]
    pub hold: String,
    #[serde(default)]
    pub entry_ntl: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotAssetCtx {
    pub coin: String,
    #[serde(default)]
    pub mid_px: Option<String>,
    #[serde(default)]
    pub mark_px: Option<String>,
}

// ============================================================================
// Domain types
// ============================================================================

/// Parse a decimal string the exchange sent; malformed input counts as zero.
pub fn parse_decimal(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(0.0)
}

/// Trade direction as carried through aggregation keys and signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Buy,
    Sell,
}

/// Raw `dir` value of a fill that flips a futures position long-to-short.
pub const DIR_LONG_TO_SHORT: &str = "Long > Short";
/// Raw `dir` value of a fill that flips a futures position short-to-long.
pub const DIR_SHORT_TO_LONG: &str = "Short > Long";

impl Direction {
    /// Every direction an aggregation can be keyed under.
    pub const ALL: [Direction; 6] = [
        Direction::OpenLong,
        Direction::OpenShort,
        Direction::CloseLong,
        Direction::CloseShort,
        Direction::Buy,
        Direction::Sell,
    ];

    pub fn parse(raw: &str) -> Option<Direction> {
        match raw {
            "Open Long" => Some(Direction::OpenLong),
            "Open Short" => Some(Direction::OpenShort),
            "Close Long" => Some(Direction::CloseLong),
            "Close Short" => Some(Direction::CloseShort),
            "Buy" => Some(Direction::Buy),
            "Sell" => Some(Direction::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::OpenLong => "Open Long",
            Direction::OpenShort => "Open Short",
            Direction::CloseLong => "Close Long",
            Direction::CloseShort => "Close Short",
            Direction::Buy => "Buy",
            Direction::Sell => "Sell",
        }
    }

    /// Spot directions resolve symbols through the spot map, everything else
    /// through the perp map.
    pub fn is_spot(&self) -> bool {
        matches!(self, Direction::Buy | Direction::Sell)
    }

    pub fn is_close(&self) -> bool {
        matches!(
            self,
            Direction::CloseLong | Direction::CloseShort | Direction::Sell
        )
    }

    /// Signal action: "open" or "close".
    pub fn action(&self) -> &'static str {
        if self.is_close() {
            "close"
        } else {
            "open"
        }
    }

    /// Signal side. Spot trades always report the LONG side.
    pub fn side(&self) -> &'static str {
        match self {
            Direction::OpenShort | Direction::CloseShort => "SHORT",
            _ => "LONG",
        }
    }

    pub fn asset_type(&self) -> AssetType {
        if self.is_spot() {
            AssetType::Spot
        } else {
            AssetType::Futures
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetType {
    Spot,
    Futures,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Spot => "spot",
            AssetType::Futures => "futures",
        }
    }
}

/// A fill after direction resolution (reversals already split into legs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub oid: u64,
    pub tid: u64,
    pub coin: String,
    pub side: String,
    pub sz: String, // decimal string, retained as received
    pub px: String, // decimal string, retained as received
    pub start_position: f64,
    pub time: i64, // server time, ms
}

impl Fill {
    pub fn from_ws(ws: &WsFill) -> Self {
        Self {
            oid: ws.oid,
            tid: ws.tid,
            coin: ws.coin.clone(),
            side: ws.side.clone(),
            sz: ws.sz.clone(),
            px: ws.px.clone(),
            start_position: parse_decimal(&ws.start_position),
            time: ws.time,
        }
    }

    pub fn size(&self) -> f64 {
        parse_decimal(&self.sz)
    }

    pub fn price(&self) -> f64 {
        parse_decimal(&self.px)
    }
}

/// The published output message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub address: String,
    pub asset_type: String, // "spot" | "futures"
    pub symbol: String,
    pub direction: String, // "open" | "close"
    pub side: String,      // "LONG" | "SHORT"
    /// Traded notional as a percentage of total balance
    pub position_rate: f64,
    /// Fraction of the current position being closed (0 for opens)
    pub close_rate: f64,
    pub size: f64,
    pub price: f64,
    pub timestamp: i64, // ms, first fill's server time
}

/// Persisted aggregation state, upserted by (address, order_id, direction).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAggregationRow {
    pub address: String,
    pub order_id: u64,
    pub direction: String,
    pub symbol: String,
    pub total_size: f64,
    pub avg_price: f64,
    pub fill_count: u32,
    pub order_status: String,
    pub signal_sent: bool,
    pub first_fill_time: i64, // ms
    pub last_fill_time: i64,  // ms
    /// Raw fills as received, JSON-encoded
    pub fills_json: String,
}

/// Per-address balance snapshot, upserted by address.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionRecord {
    pub address: String,
    pub spot_total_usd: f64,
    pub account_value: f64,
    pub spot_balances: Vec<SpotBalanceEntry>,
    pub futures_positions: Vec<FuturesPositionEntry>,
    pub snapshot_time: i64, // ms
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotBalanceEntry {
    pub coin: String,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuturesPositionEntry {
    pub symbol: String,
    pub szi: f64,
}

impl PositionRecord {
    /// Spot balance for a coin, if the last snapshot had one.
    pub fn spot_balance(&self, coin: &str) -> Option<f64> {
        self.spot_balances
            .iter()
            .find(|b| b.coin == coin)
            .map(|b| b.total)
    }

    /// Unsigned futures position size for a display symbol.
    pub fn futures_position(&self, symbol: &str) -> Option<f64> {
        self.futures_positions
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.szi.abs())
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
