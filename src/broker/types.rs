//! Broker wire types. Monetary integers arrive in cents unless noted;
//! `market_exposure` is centi-cents and is mirrored raw.

use serde::{Deserialize, Serialize};

/// `/events/{ticker}` response: event header plus per-strike markets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    #[serde(default)]
    pub event: Option<EventInfo>,
    #[serde(default)]
    pub markets: Vec<BrokerMarket>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInfo {
    pub event_ticker: String,
    #[serde(default)]
    pub title: Option<String>,
    /// UTC expiry of the hourly event.
    #[serde(default)]
    pub strike_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMarket {
    pub ticker: String,
    /// Quoted one cent below the round strike (e.g. 118999.99).
    #[serde(default)]
    pub floor_strike: Option<f64>,
    #[serde(default)]
    pub yes_bid: Option<i64>,
    #[serde(default)]
    pub yes_ask: Option<i64>,
    #[serde(default)]
    pub no_bid: Option<i64>,
    #[serde(default)]
    pub no_ask: Option<i64>,
    #[serde(default)]
    pub last_price: Option<i64>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub volume_24h: Option<i64>,
    #[serde(default)]
    pub open_interest: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub close_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    /// Cents.
    pub balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionsResponse {
    #[serde(default)]
    pub market_positions: Vec<ApiMarketPosition>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiMarketPosition {
    pub ticker: String,
    /// Signed contract count.
    pub position: i64,
    #[serde(default)]
    pub total_traded: i64,
    /// Centi-cents.
    #[serde(default)]
    pub market_exposure: i64,
    #[serde(default)]
    pub realized_pnl: i64,
    /// Cents.
    #[serde(default)]
    pub fees_paid: i64,
    #[serde(default)]
    pub last_updated_ts: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillsResponse {
    #[serde(default)]
    pub fills: Vec<ApiFill>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiFill {
    pub trade_id: String,
    pub ticker: String,
    #[serde(default)]
    pub order_id: String,
    pub side: String,
    #[serde(default)]
    pub action: String,
    pub count: i64,
    /// Cents.
    pub yes_price: i64,
    /// Cents.
    pub no_price: i64,
    #[serde(default)]
    pub is_taker: bool,
    pub created_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrdersResponse {
    #[serde(default)]
    pub orders: Vec<ApiOrder>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiOrder {
    pub order_id: String,
    pub ticker: String,
    pub side: String,
    pub action: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub yes_price: Option<i64>,
    #[serde(default)]
    pub no_price: Option<i64>,
    #[serde(default, alias = "remaining_count")]
    pub count: i64,
    #[serde(default)]
    pub created_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementsResponse {
    #[serde(default)]
    pub settlements: Vec<ApiSettlement>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettlement {
    pub ticker: String,
    #[serde(default)]
    pub market_result: String,
    /// Cents; sign decides the settled side.
    pub revenue: i64,
    #[serde(default)]
    pub yes_count: i64,
    #[serde(default)]
    pub no_count: i64,
    pub settled_time: String,
}

/// Market order submitted by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub ticker: String,
    pub client_order_id: String,
    /// "yes" | "no".
    pub side: String,
    /// "buy" | "sell".
    pub action: String,
    pub count: i64,
    #[serde(rename = "type")]
    pub order_type: String,
    /// Spend cap for market buys, cents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buy_max_cost: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order: OrderAck,
}

// --- WebSocket envelope -----------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WsSubscribeCmd {
    pub id: i64,
    pub cmd: &'static str,
    pub params: WsSubscribeParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct WsSubscribeParams {
    pub channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_tickers: Option<Vec<String>>,
}

/// Generic server frame; `msg` is decoded per `type`.
#[derive(Debug, Clone, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub sid: Option<i64>,
    #[serde(default)]
    pub seq: Option<i64>,
    #[serde(default)]
    pub msg: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderbookDeltaMsg {
    pub market_ticker: String,
    /// 1-99 cents.
    pub price: i64,
    /// Signed quantity change.
    pub delta: i64,
    pub side: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderbookSnapshotMsg {
    pub market_ticker: String,
    #[serde(default)]
    pub yes: Vec<[i64; 2]>,
    #[serde(default)]
    pub no: Vec<[i64; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketPositionMsg {
    pub market_ticker: String,
    #[serde(default)]
    pub position: i64,
}

/// Cents → decimal probability units.
pub fn cents_to_decimal(cents: i64) -> f64 {
    cents as f64 / 100.0
}
