//! Trade executor: the broker order adapter.
//!
//! Intentionally thin. An open ticket becomes a market buy on the ticket's
//! side; a close ticket arrives with the side already inverted and becomes
//! a market buy of the opposing contract. All lifecycle state lives in the
//! trade manager.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::broker::types::OrderRequest;
use crate::broker::BrokerApi;
use crate::models::{TicketIntent, TradeTicket};

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TradeExecutor {
    broker: Arc<dyn BrokerApi>,
}

impl TradeExecutor {
    pub fn new(broker: Arc<dyn BrokerApi>) -> Self {
        Self { broker }
    }

    /// Submit the ticket's order. Returns the broker order id on ack; a
    /// transport error or timeout surfaces as `Err` for the manager to
    /// interpret.
    pub async fn submit(&self, ticket: &TradeTicket) -> Result<String> {
        let order = build_order(ticket);
        let ack = tokio::time::timeout(SUBMIT_TIMEOUT, self.broker.create_order(&order))
            .await
            .map_err(|_| anyhow!("executor submit timed out"))?
            .context("executor submit")?;
        info!(
            ticket_id = %ticket.ticket_id,
            order_id = %ack.order.order_id,
            intent = ?ticket.intent,
            "order accepted"
        );
        Ok(ack.order.order_id)
    }
}

fn build_order(ticket: &TradeTicket) -> OrderRequest {
    // Cap spend on entries; closes take whatever the book offers.
    let buy_max_cost = match ticket.intent {
        TicketIntent::Open => {
            let price_cents = (ticket.buy_price * 100.0).round() as i64;
            Some(price_cents * ticket.position)
        }
        TicketIntent::Close => None,
    };
    OrderRequest {
        ticker: ticket.ticker.clone(),
        client_order_id: ticket.ticket_id.clone(),
        side: ticket.side.broker_str().to_string(),
        action: "buy".to_string(),
        count: ticket.position,
        order_type: "market".to_string(),
        buy_max_cost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryMethod, Side};

    fn ticket(intent: TicketIntent, side: Side) -> TradeTicket {
        TradeTicket {
            ticket_id: "TICKET-x".into(),
            intent,
            close_trade_id: None,
            date: "2026-01-17".into(),
            time: "14:05:09".into(),
            symbol: "BTC".into(),
            market: "Kalshi".into(),
            trade_strategy: "Hourly HTC".into(),
            contract: "BTC 3pm".into(),
            strike: 119_000.0,
            side,
            ticker: "KXBTCD-26JAN1715-T119000".into(),
            buy_price: 0.93,
            sell_price: None,
            position: 3,
            prob: Some(95.5),
            symbol_open: None,
            symbol_close: None,
            momentum: None,
            entry_method: EntryMethod::Auto,
            close_method: None,
        }
    }

    #[test]
    fn open_ticket_becomes_capped_market_buy() {
        let order = build_order(&ticket(TicketIntent::Open, Side::Yes));
        assert_eq!(order.action, "buy");
        assert_eq!(order.side, "yes");
        assert_eq!(order.order_type, "market");
        assert_eq!(order.count, 3);
        assert_eq!(order.buy_max_cost, Some(93 * 3));
        assert_eq!(order.client_order_id, "TICKET-x");
    }

    #[test]
    fn close_ticket_buys_inverted_side_uncapped() {
        // The initiator already inverted the side on the close ticket.
        let order = build_order(&ticket(TicketIntent::Close, Side::No));
        assert_eq!(order.action, "buy");
        assert_eq!(order.side, "no");
        assert_eq!(order.buy_max_cost, None);
    }
}
