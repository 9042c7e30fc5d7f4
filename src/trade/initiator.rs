//! Trade initiator: the one stateless gate through which every open and
//! close enters the system. Validates the request, mints the canonical
//! ticket, stamps exchange-timezone wall time and the live market context,
//! and forwards to the manager. Persists nothing itself.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::models::{
    now_exchange, truncate_contract_name, EntryMethod, OpenTradeRequest, TicketIntent, TradeTicket,
};
use crate::state::LiveState;
use crate::store::settings::SettingsStore;
use crate::trade::manager::TradeManager;

const SERVICE: &str = "trade_initiator";

pub struct TradeInitiator {
    manager: Arc<TradeManager>,
    state: LiveState,
    settings: SettingsStore,
    symbol: String,
    market: String,
}

impl TradeInitiator {
    pub fn new(
        manager: Arc<TradeManager>,
        state: LiveState,
        settings: SettingsStore,
        symbol: String,
        market: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            state,
            settings,
            symbol,
            market,
        })
    }

    /// Open path: normalize a trade request into a pending ledger trade.
    /// Returns the ledger id and the minted ticket id.
    pub async fn open(&self, request: OpenTradeRequest) -> Result<(i64, String)> {
        validate_open_request(&request)?;

        let prefs = self.settings.trade_preferences().await?;
        let position = request
            .position
            .or_else(|| prefs.as_ref().map(|p| p.effective_position()))
            .unwrap_or(1);
        let trade_strategy = prefs
            .as_ref()
            .map(|p| p.trade_strategy.clone())
            .unwrap_or_else(|| "Hourly HTC".to_string());

        let contract = request
            .contract
            .clone()
            .or_else(|| self.state.watchlist().map(|w| w.market_title.clone()))
            .unwrap_or_else(|| format!("{} Market", self.symbol));

        let now = now_exchange();
        let ticket = TradeTicket {
            ticket_id: mint_ticket_id(),
            intent: TicketIntent::Open,
            close_trade_id: None,
            date: now.format("%Y-%m-%d").to_string(),
            time: now.format("%H:%M:%S").to_string(),
            symbol: request.symbol.clone().unwrap_or_else(|| self.symbol.clone()),
            market: request.market.clone().unwrap_or_else(|| self.market.clone()),
            trade_strategy,
            contract: truncate_contract_name(&contract),
            strike: request.strike,
            side: request.side,
            ticker: request.ticker.clone(),
            buy_price: request.buy_price,
            sell_price: None,
            position,
            prob: Some(request.prob),
            symbol_open: self.state.price().map(|p| p.price),
            symbol_close: None,
            momentum: self.state.momentum().map(|m| m.round() as i64),
            entry_method: request.entry_method,
            close_method: None,
        };

        info!(
            ticket_id = %ticket.ticket_id,
            strike = ticket.strike,
            side = ticket.side.as_str(),
            entry = ticket.entry_method.as_str(),
            "open ticket minted"
        );
        self.manager
            .ledger()
            .log_ticket_event(&ticket.ticket_id, SERVICE, "OPEN TICKET CREATED")
            .await;
        let ticket_id = ticket.ticket_id.clone();
        let id = self.manager.open_trade(ticket).await?;
        Ok((id, ticket_id))
    }

    /// Close path: fetch the trade, invert the side, mint a fresh ticket
    /// and forward the close intent.
    pub async fn close(&self, trade_id: i64, sell_price: f64, close_method: &str) -> Result<String> {
        let Some(trade) = self.manager.ledger().get(trade_id).await? else {
            return Err(anyhow!("no trade found for id {trade_id}"));
        };

        let now = now_exchange();
        let ticket = TradeTicket {
            ticket_id: mint_ticket_id(),
            intent: TicketIntent::Close,
            close_trade_id: Some(trade.id),
            date: now.format("%Y-%m-%d").to_string(),
            time: now.format("%H:%M:%S").to_string(),
            symbol: trade.symbol.clone(),
            market: trade.market.clone(),
            trade_strategy: trade.trade_strategy.clone(),
            contract: trade.contract.clone(),
            strike: trade.strike,
            // The close buys the opposing contract.
            side: trade.side.invert(),
            ticker: trade.ticker.clone(),
            buy_price: trade.buy_price,
            sell_price: Some(sell_price),
            position: trade.position,
            prob: trade.prob,
            symbol_open: trade.symbol_open,
            symbol_close: self.state.price().map(|p| p.price),
            momentum: self.state.momentum().map(|m| m.round() as i64),
            entry_method: trade.entry_method,
            close_method: Some(close_method.to_string()),
        };

        info!(ticket_id = %ticket.ticket_id, trade_id, close_method, "close ticket minted");
        self.manager
            .ledger()
            .log_ticket_event(&ticket.ticket_id, SERVICE, "CLOSE TICKET CREATED")
            .await;
        let ticket_id = ticket.ticket_id.clone();
        self.manager.close_trade(ticket).await?;
        Ok(ticket_id)
    }
}

fn mint_ticket_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!(
        "TICKET-{}-{}",
        &uuid[..9],
        chrono::Utc::now().timestamp_millis()
    )
}

fn validate_open_request(request: &OpenTradeRequest) -> Result<()> {
    if request.ticker.trim().is_empty() {
        return Err(anyhow!("missing required field: ticker"));
    }
    if request.strike <= 0.0 {
        return Err(anyhow!("invalid strike: {}", request.strike));
    }
    if !(request.buy_price > 0.0 && request.buy_price <= 1.0) {
        return Err(anyhow!("buy_price out of range: {}", request.buy_price));
    }
    if !(0.0..=100.0).contains(&request.prob) {
        return Err(anyhow!("prob out of range: {}", request.prob));
    }
    if let Some(position) = request.position {
        if position <= 0 {
            return Err(anyhow!("position must be positive"));
        }
    }
    Ok(())
}
