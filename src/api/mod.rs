//! HTTP surface: trade creation, reads for the UI, and the cross-process
//! notification endpoints that make up the bus's second transport.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::auto_entry::AutoEntrySupervisor;
use crate::bus::EventBus;
use crate::models::{BusEvent, OpenTradeRequest, TradeStatus};
use crate::state::LiveState;
use crate::store::account::AccountStore;
use crate::store::ledger::TradeLedger;
use crate::store::settings::SettingsStore;
use crate::trade::initiator::TradeInitiator;
use crate::trade::manager::TradeManager;
use crate::trade::monitor::ActiveTradeSupervisor;

#[derive(Clone)]
pub struct ApiState {
    pub live: LiveState,
    pub ledger: TradeLedger,
    pub account: AccountStore,
    pub settings: SettingsStore,
    pub manager: Arc<TradeManager>,
    pub initiator: Arc<TradeInitiator>,
    pub monitor: Arc<ActiveTradeSupervisor>,
    pub auto_entry: Arc<AutoEntrySupervisor>,
    pub bus: EventBus,
    pub symbol: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/trades", post(create_trade).get(get_trades))
        .route("/api/update_trade_status", post(update_trade_status))
        .route("/api/positions_updated", post(positions_updated))
        .route("/api/trade_manager_notification", post(trade_manager_notification))
        .route("/api/notify_db_change", post(notify_db_change))
        .route("/api/notify_automated_trade", post(notify_automated_trade))
        .route("/api/btc_price", get(current_price))
        .route("/api/price", get(current_price))
        .route("/api/active_trades", get(active_trades))
        .route("/api/strike_table", get(strike_table))
        .route("/api/watchlist", get(watchlist))
        .route("/api/balance", get(balance))
        .route("/api/ticket_log", get(ticket_log))
        .route("/api/check_expired_trades", post(check_expired_trades))
        .route("/api/poll_settlements", post(poll_settlements))
        .route(
            "/api/auto_entry_settings",
            get(get_auto_entry_settings).post(set_auto_entry_settings),
        )
        .route(
            "/api/trade_preferences",
            get(get_trade_preferences).post(set_trade_preferences),
        )
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `POST /trades` accepts either an open request or a close request; a
/// close is recognized by its `trade_id`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TradeRequestBody {
    Close { trade_id: i64, sell_price: f64 },
    Open(OpenTradeRequest),
}

async fn create_trade(
    State(state): State<ApiState>,
    Json(body): Json<TradeRequestBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, Json<serde_json::Value>)> {
    match body {
        TradeRequestBody::Open(request) => {
            let (id, ticket_id) = state.initiator.open(request).await.map_err(|e| {
                warn!(error = %e, "open trade rejected");
                (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
            })?;
            Ok((StatusCode::CREATED, Json(json!({ "id": id, "ticket_id": ticket_id }))))
        }
        TradeRequestBody::Close {
            trade_id,
            sell_price,
        } => {
            state
                .initiator
                .close(trade_id, sell_price, "manual")
                .await
                .map_err(|e| {
                    warn!(error = %e, trade_id, "close trade rejected");
                    (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
                })?;
            Ok((StatusCode::OK, Json(json!({ "message": "Close ticket received" }))))
        }
    }
}

#[derive(Debug, Deserialize)]
struct TradesQuery {
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn get_trades(
    State(state): State<ApiState>,
    Query(params): Query<TradesQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let trades = match params.status.as_deref().and_then(TradeStatus::parse) {
        Some(status) => state.ledger.by_status(status).await,
        None => state.ledger.all_recent(params.limit.unwrap_or(100)).await,
    }
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({ "count": trades.len(), "trades": trades })))
}

#[derive(Debug, Deserialize)]
struct UpdateStatusBody {
    trade_id: i64,
    status: String,
}

/// Executor -> manager status report.
async fn update_trade_status(
    State(state): State<ApiState>,
    Json(body): Json<UpdateStatusBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    state
        .manager
        .report_executor_status(body.trade_id, &body.status)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct PositionsUpdatedBody {
    #[allow(dead_code)]
    database: Option<String>,
}

/// Account sync -> manager trigger (cross-process transport).
async fn positions_updated(
    State(state): State<ApiState>,
    Json(_body): Json<PositionsUpdatedBody>,
) -> Json<serde_json::Value> {
    state.manager.on_positions_changed().await;
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct ManagerNotificationBody {
    trade_id: i64,
    #[allow(dead_code)]
    ticket_id: Option<String>,
    status: String,
}

/// Manager -> active-trade supervisor direct notification.
async fn trade_manager_notification(
    State(state): State<ApiState>,
    Json(body): Json<ManagerNotificationBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let Some(status) = TradeStatus::parse(&body.status) else {
        return Err(StatusCode::BAD_REQUEST);
    };
    state.monitor.handle_trade_change(body.trade_id, status).await;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct DbChangeBody {
    db_name: String,
    #[allow(dead_code)]
    timestamp: Option<String>,
    #[allow(dead_code)]
    change_data: Option<serde_json::Value>,
}

/// Peer notification into the local bus.
async fn notify_db_change(
    State(state): State<ApiState>,
    Json(body): Json<DbChangeBody>,
) -> Json<serde_json::Value> {
    info!(db = %body.db_name, "db change notification received");
    if matches!(body.db_name.as_str(), "positions" | "fills") {
        state.manager.on_positions_changed().await;
    }
    state.bus.publish(BusEvent::DbChanged {
        db_name: body.db_name,
    });
    Json(json!({ "ok": true }))
}

async fn notify_automated_trade(
    State(state): State<ApiState>,
    Json(payload): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    info!(?payload, "automated trade notification");
    state.bus.publish(BusEvent::DbChanged {
        db_name: "automated_trades".to_string(),
    });
    Json(json!({ "ok": true }))
}

async fn current_price(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let Some(point) = state.live.price() else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    Ok(Json(json!({
        "symbol": state.symbol,
        "price": point.price,
        "timestamp": point.ts,
        "momentum": state.live.momentum(),
    })))
}

async fn active_trades(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let trades = state
        .monitor
        .active_trades()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({ "count": trades.len(), "active_trades": trades })))
}

async fn strike_table(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.live.strike_table() {
        Some(doc) => Ok(Json(serde_json::to_value(&*doc).unwrap_or_default())),
        None => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn watchlist(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.live.watchlist() {
        Some(doc) => Ok(Json(serde_json::to_value(&*doc).unwrap_or_default())),
        None => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn balance(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let balance = state
        .account
        .balance()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({ "balance": balance })))
}

#[derive(Debug, Deserialize)]
struct TicketLogQuery {
    ticket_id: String,
}

async fn ticket_log(
    State(state): State<ApiState>,
    Query(params): Query<TicketLogQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let entries = state
        .ledger
        .ticket_log(&params.ticket_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({ "entries": entries })))
}

/// Manual expiry processing trigger.
async fn check_expired_trades(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    state
        .manager
        .run_expiry_cycle()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({ "ok": true })))
}

/// Manual settlement polling for trades stuck in `expired`.
async fn poll_settlements(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let expired = state
        .ledger
        .by_status(TradeStatus::Expired)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let tickers: Vec<String> = expired.into_iter().map(|t| t.ticker).collect();
    if tickers.is_empty() {
        return Ok(Json(json!({ "ok": true, "outstanding": 0 })));
    }
    let manager = state.manager.clone();
    let count = tickers.len();
    tokio::spawn(async move {
        manager.poll_settlements(tickers).await;
    });
    Ok(Json(json!({ "ok": true, "outstanding": count })))
}

async fn get_auto_entry_settings(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let settings = state
        .settings
        .auto_entry_settings()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({ "settings": settings })))
}

async fn set_auto_entry_settings(
    State(state): State<ApiState>,
    Json(settings): Json<crate::config::AutoEntrySettings>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    state
        .settings
        .set_auto_entry_settings(&settings)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    info!("auto entry settings updated");
    Ok(Json(json!({ "ok": true })))
}

async fn get_trade_preferences(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let prefs = state
        .settings
        .trade_preferences()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({ "preferences": prefs })))
}

async fn set_trade_preferences(
    State(state): State<ApiState>,
    Json(prefs): Json<crate::config::TradePreferences>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    state
        .settings
        .set_trade_preferences(&prefs)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    info!("trade preferences updated");
    Ok(Json(json!({ "ok": true })))
}

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let now = chrono::Utc::now().timestamp();
    let heartbeats = state.live.heartbeats();
    let components: serde_json::Map<String, serde_json::Value> = heartbeats
        .iter()
        .map(|(name, ts)| {
            (
                name.clone(),
                json!({ "last_seen": ts, "healthy": now - ts < 30 }),
            )
        })
        .collect();
    Json(json!({
        "status": "ok",
        "auto_entry_state": state.auto_entry.operational_state().as_str(),
        "components": components,
        "timestamp": now,
    }))
}
