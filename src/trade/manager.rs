//! Trade manager: ledger authority and lifecycle state machine.
//!
//! Open tickets land as `pending` and are confirmed to `open` once the
//! positions mirror shows a live position. Close tickets go `closing` and
//! resolve to `closed` when the position zeroes out. The hourly boundary
//! expires whatever is still open; settlements finish the job. Any
//! multi-step update for a trade runs under that trade's mutex so
//! near-simultaneous mirror updates cannot interleave.

use anyhow::{anyhow, Result};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::bus::{EventBus, Notifier};
use crate::models::{
    now_exchange, BusEvent, Side, TicketIntent, Trade, TradeStatus, TradeTicket, WinLoss,
};
use crate::state::LiveState;
use crate::store::account::AccountStore;
use crate::store::ledger::{round2, TradeLedger};
use crate::trade::executor::TradeExecutor;

/// How long a pending trade may wait for its position to materialize.
const OPEN_CONFIRM_DEADLINE: Duration = Duration::from_secs(30);
const OPEN_CONFIRM_POLL: Duration = Duration::from_secs(1);

/// Settlement polling after expiry.
const SETTLEMENT_DEADLINE: Duration = Duration::from_secs(30 * 60);
const SETTLEMENT_POLL: Duration = Duration::from_secs(2);

const SERVICE: &str = "trade_manager";

pub struct TradeManager {
    ledger: TradeLedger,
    account: AccountStore,
    executor: Arc<TradeExecutor>,
    bus: EventBus,
    notifier: Notifier,
    state: LiveState,
    /// Per-trade mutexes serializing multi-step reconciliations.
    trade_locks: SyncMutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl TradeManager {
    pub fn new(
        ledger: TradeLedger,
        account: AccountStore,
        executor: Arc<TradeExecutor>,
        bus: EventBus,
        notifier: Notifier,
        state: LiveState,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            account,
            executor,
            bus,
            notifier,
            state,
            trade_locks: SyncMutex::new(HashMap::new()),
        })
    }

    pub fn ledger(&self) -> &TradeLedger {
        &self.ledger
    }

    fn lock_for(&self, trade_id: i64) -> Arc<AsyncMutex<()>> {
        self.trade_locks
            .lock()
            .entry(trade_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn publish_change(&self, trade_id: i64, ticket_id: &str, status: TradeStatus) {
        self.bus.publish(BusEvent::TradeChanged {
            trade_id,
            ticket_id: ticket_id.to_string(),
            status,
        });
        self.notifier
            .notify_trade_change(trade_id, ticket_id, status.as_str())
            .await;
    }

    /// Open flow entry point: persist pending, hand to the executor, watch
    /// the positions mirror until confirmation or deadline.
    pub async fn open_trade(self: &Arc<Self>, ticket: TradeTicket) -> Result<i64> {
        if ticket.intent != TicketIntent::Open {
            return Err(anyhow!("open_trade requires an open ticket"));
        }
        let id = self.ledger.insert_open_ticket(&ticket).await?;
        self.ledger
            .log_ticket_event(&ticket.ticket_id, SERVICE, "TICKET RECEIVED — status pending")
            .await;
        self.publish_change(id, &ticket.ticket_id, TradeStatus::Pending).await;

        let manager = self.clone();
        let exec_ticket = ticket.clone();
        tokio::spawn(async move {
            match manager.executor.submit(&exec_ticket).await {
                Ok(order_id) => {
                    manager
                        .ledger
                        .log_ticket_event(
                            &exec_ticket.ticket_id,
                            SERVICE,
                            &format!("SENT TO EXECUTOR — order {order_id}"),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(trade_id = id, error = %e, "executor rejected open ticket");
                    manager
                        .ledger
                        .log_ticket_event(
                            &exec_ticket.ticket_id,
                            SERVICE,
                            &format!("EXECUTOR ERROR — {e}"),
                        )
                        .await;
                    if manager.ledger.mark_error(id).await.unwrap_or(false) {
                        manager
                            .publish_change(id, &exec_ticket.ticket_id, TradeStatus::Error)
                            .await;
                    }
                }
            }
        });

        let manager = self.clone();
        tokio::spawn(async move {
            manager.confirm_open_watch(id, ticket).await;
        });
        Ok(id)
    }

    /// Poll the positions mirror until the broker position for the ticket's
    /// ticker materializes. Past the deadline the trade simply stays
    /// `pending` (the executor path may already have marked it `error`).
    async fn confirm_open_watch(self: &Arc<Self>, id: i64, ticket: TradeTicket) {
        let deadline = tokio::time::Instant::now() + OPEN_CONFIRM_DEADLINE;
        while tokio::time::Instant::now() < deadline {
            match self.try_confirm_open(id, &ticket).await {
                Ok(true) => return,
                Ok(false) => sleep(OPEN_CONFIRM_POLL).await,
                Err(e) => {
                    warn!(trade_id = id, error = %e, "open confirmation pass failed");
                    sleep(OPEN_CONFIRM_POLL).await;
                }
            }
        }
        let still_pending = matches!(
            self.ledger.get(id).await,
            Ok(Some(trade)) if trade.status == TradeStatus::Pending
        );
        if still_pending {
            self.ledger
                .log_ticket_event(&ticket.ticket_id, SERVICE, "PENDING TRADE FAILED TO FILL — TIMEOUT")
                .await;
            warn!(trade_id = id, "pending trade never filled within deadline");
        }
    }

    async fn try_confirm_open(self: &Arc<Self>, id: i64, ticket: &TradeTicket) -> Result<bool> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let Some(trade) = self.ledger.get(id).await? else {
            return Ok(true); // deleted under us; stop watching
        };
        if trade.status != TradeStatus::Pending {
            return Ok(true);
        }
        let Some(position) = self.account.position(&trade.ticker).await? else {
            return Ok(false);
        };
        let pos = position.position.abs();
        let exposure = position.market_exposure.abs();
        if pos == 0 || exposure <= 0.0 {
            return Ok(false);
        }

        // Exposure is mirrored in centi-cents: / position -> centi-cents per
        // contract, / 100 -> cents, / 100 -> decimal.
        let buy_price = round2(exposure / pos as f64 / 100.0 / 100.0);
        let diff = trade
            .prob
            .map(|prob| (prob - buy_price * 100.0).round_ties_even() as i64);
        let symbol_open = self.state.price().map(|p| p.price);

        if !self
            .ledger
            .mark_open(id, pos, buy_price, Some(position.fees_paid), diff, symbol_open)
            .await?
        {
            return Ok(true);
        }
        self.ledger
            .log_ticket_event(
                &ticket.ticket_id,
                SERVICE,
                &format!(
                    "OPEN TRADE CONFIRMED — pos={pos}, price={buy_price}, fees={:?}, diff={diff:?}",
                    position.fees_paid
                ),
            )
            .await;
        info!(trade_id = id, pos, buy_price, "trade open confirmed");
        self.publish_change(id, &ticket.ticket_id, TradeStatus::Open).await;
        Ok(true)
    }

    /// Close flow entry point: forward to the executor immediately, flip to
    /// `closing`, and let the next positions update resolve the economics.
    pub async fn close_trade(self: &Arc<Self>, ticket: TradeTicket) -> Result<()> {
        let Some(id) = ticket.close_trade_id else {
            return Err(anyhow!("close ticket missing trade id"));
        };
        let Some(trade) = self.ledger.get(id).await? else {
            // State error: close requested for an unknown trade.
            warn!(trade_id = id, "close requested for unknown trade");
            return Ok(());
        };
        if trade.status != TradeStatus::Open {
            warn!(trade_id = id, status = trade.status.as_str(), "close requested for non-open trade");
            return Ok(());
        }

        let close_method = ticket.close_method.clone().unwrap_or_else(|| "manual".into());
        if !self.ledger.mark_closing(id, &close_method).await? {
            return Ok(());
        }
        self.ledger
            .log_ticket_event(&ticket.ticket_id, SERVICE, "CLOSE TICKET RECEIVED — status closing")
            .await;
        self.publish_change(id, &trade.ticket_id, TradeStatus::Closing).await;

        let manager = self.clone();
        let exec_ticket = ticket.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.executor.submit(&exec_ticket).await {
                // The position watch still resolves the trade if the broker
                // filled despite the error surface.
                warn!(error = %e, "executor close submit failed");
                manager
                    .ledger
                    .log_ticket_event(&exec_ticket.ticket_id, SERVICE, &format!("EXECUTOR ERROR — {e}"))
                    .await;
            }
        });

        // Positions may already mirror the close.
        self.try_confirm_close_by_id(id).await.ok();
        Ok(())
    }

    /// Entry point for positions/fills change notifications from account
    /// sync (bus or HTTP). Resolves any `closing` trades whose position has
    /// zeroed out.
    pub async fn on_positions_changed(self: &Arc<Self>) {
        let closing = match self.ledger.by_status(TradeStatus::Closing).await {
            Ok(trades) => trades,
            Err(e) => {
                warn!(error = %e, "reading closing trades failed");
                return;
            }
        };
        for trade in closing {
            if let Err(e) = self.try_confirm_close(&trade).await {
                warn!(trade_id = trade.id, error = %e, "close confirmation failed");
            }
        }
    }

    async fn try_confirm_close_by_id(self: &Arc<Self>, id: i64) -> Result<()> {
        if let Some(trade) = self.ledger.get(id).await? {
            if trade.status == TradeStatus::Closing {
                self.try_confirm_close(&trade).await?;
            }
        }
        Ok(())
    }

    async fn try_confirm_close(self: &Arc<Self>, trade: &Trade) -> Result<()> {
        let lock = self.lock_for(trade.id);
        let _guard = lock.lock().await;

        // Re-read under the lock; another pass may have closed it already.
        let Some(current) = self.ledger.get(trade.id).await? else {
            return Ok(());
        };
        if current.status != TradeStatus::Closing {
            return Ok(());
        }

        let Some(position) = self.account.position(&current.ticker).await? else {
            return Ok(());
        };
        if position.position != 0 {
            return Ok(());
        }

        // Closing bought the opposite side; its most recent fill prices the
        // exit: sell_price = 1 - fill price on that side.
        let opposite = current.side.invert().broker_str();
        let Some(fill) = self.account.latest_fill_on_side(&current.ticker, opposite).await? else {
            self.ledger
                .log_ticket_event(
                    &current.ticket_id,
                    SERVICE,
                    "POSITION ZEROED but no closing fill found yet",
                )
                .await;
            return Ok(());
        };
        let sell_price = match current.side {
            Side::Yes => round2(1.0 - fill.no_price),
            Side::No => round2(1.0 - fill.yes_price),
        };

        let fees = position.fees_paid;
        let pnl = round2(
            current.position as f64 * sell_price - current.position as f64 * current.buy_price
                - fees,
        );
        let win_loss = WinLoss::from_pnl(pnl);
        let symbol_close = self.state.price().map(|p| p.price);
        let closed_at = now_exchange().format("%H:%M:%S").to_string();

        if !self
            .ledger
            .finalize_closed(current.id, sell_price, symbol_close, Some(fees), pnl, win_loss, &closed_at)
            .await?
        {
            return Ok(());
        }
        self.ledger
            .log_ticket_event(
                &current.ticket_id,
                SERVICE,
                &format!("CLOSE TRADE CONFIRMED — PnL: {pnl}, W/L: {}", win_loss.as_str()),
            )
            .await;
        info!(trade_id = current.id, pnl, "trade closed");
        self.publish_change(current.id, &current.ticket_id, TradeStatus::Closed).await;
        Ok(())
    }

    /// Executor failure report (`POST /api/update_trade_status`).
    pub async fn report_executor_status(self: &Arc<Self>, trade_id: i64, status: &str) -> Result<()> {
        if status != "error" {
            return Ok(());
        }
        let Some(trade) = self.ledger.get(trade_id).await? else {
            return Ok(());
        };
        if self.ledger.mark_error(trade_id).await? {
            self.publish_change(trade_id, &trade.ticket_id, TradeStatus::Error).await;
        }
        Ok(())
    }

    /// Hourly boundary: purge errors, expire whatever is still open, then
    /// poll settlements until everything resolves or the deadline passes.
    pub async fn run_expiry_cycle(self: &Arc<Self>) -> Result<()> {
        let deleted = self.ledger.delete_error_trades().await?;
        if deleted > 0 {
            info!(deleted, "purged error trades before expiry");
        }

        let closed_at = now_exchange().format("%H:%M:%S").to_string();
        let symbol_close = self.state.price().map(|p| p.price);
        let expired = self
            .ledger
            .mark_expired_open_trades(&closed_at, symbol_close)
            .await?;
        if expired.is_empty() {
            return Ok(());
        }
        info!(count = expired.len(), "trades expired at hourly boundary");

        for (id, ticket_id, _) in &expired {
            self.publish_change(*id, ticket_id, TradeStatus::Expired).await;
        }

        let tickers: Vec<String> = expired.into_iter().map(|(_, _, ticker)| ticker).collect();
        let manager = self.clone();
        tokio::spawn(async move {
            manager.poll_settlements(tickers).await;
        });
        Ok(())
    }

    /// Resolve expired trades against mirrored settlements. Trades without
    /// a settlement at the deadline stay `expired` for manual handling.
    pub async fn poll_settlements(self: &Arc<Self>, tickers: Vec<String>) {
        let deadline = tokio::time::Instant::now() + SETTLEMENT_DEADLINE;
        let mut outstanding: Vec<String> = tickers;

        while !outstanding.is_empty() && tokio::time::Instant::now() < deadline {
            let mut still_waiting = Vec::new();
            for ticker in outstanding {
                match self.settle_one(&ticker).await {
                    Ok(true) => {}
                    Ok(false) => still_waiting.push(ticker),
                    Err(e) => {
                        warn!(ticker = %ticker, error = %e, "settlement pass failed");
                        still_waiting.push(ticker);
                    }
                }
            }
            outstanding = still_waiting;
            if !outstanding.is_empty() {
                sleep(SETTLEMENT_POLL).await;
            }
        }
        if !outstanding.is_empty() {
            warn!(?outstanding, "settlement polling deadline reached; trades left expired");
        }
    }

    async fn settle_one(self: &Arc<Self>, ticker: &str) -> Result<bool> {
        let Some(settlement) = self.account.latest_settlement(ticker).await? else {
            return Ok(false);
        };
        let sell_price = if settlement.revenue > 0.0 { 1.0 } else { 0.0 };
        let fees = self
            .account
            .position(ticker)
            .await?
            .map(|p| p.fees_paid);

        let Some((id, ticket_id, pnl)) = self.ledger.settle_expired(ticker, sell_price, fees).await?
        else {
            // No expired trade for this ticker (already resolved).
            return Ok(true);
        };
        self.ledger
            .log_ticket_event(
                &ticket_id,
                SERVICE,
                &format!("SETTLEMENT RESOLVED — sell_price={sell_price}, pnl={pnl}"),
            )
            .await;
        self.publish_change(id, &ticket_id, TradeStatus::Closed).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::types::*;
    use crate::models::EntryMethod;
    use crate::store::account::{FillRow, PositionRow};
    use async_trait::async_trait;

    /// Broker double that acks every order.
    struct AckBroker;

    #[async_trait]
    impl crate::broker::BrokerApi for AckBroker {
        async fn get_event(&self, _: &str) -> Result<EventResponse> {
            Err(anyhow!("not used"))
        }
        async fn get_balance(&self) -> Result<BalanceResponse> {
            Ok(BalanceResponse { balance: 0 })
        }
        async fn get_positions(&self, _: Option<&str>) -> Result<PositionsResponse> {
            Ok(PositionsResponse {
                market_positions: vec![],
                cursor: None,
            })
        }
        async fn get_fills(&self, _: Option<&str>) -> Result<FillsResponse> {
            Ok(FillsResponse {
                fills: vec![],
                cursor: None,
            })
        }
        async fn get_orders(&self, _: Option<&str>) -> Result<OrdersResponse> {
            Ok(OrdersResponse {
                orders: vec![],
                cursor: None,
            })
        }
        async fn get_settlements(&self, _: Option<&str>) -> Result<SettlementsResponse> {
            Ok(SettlementsResponse {
                settlements: vec![],
                cursor: None,
            })
        }
        async fn create_order(&self, order: &OrderRequest) -> Result<OrderResponse> {
            Ok(OrderResponse {
                order: OrderAck {
                    order_id: format!("ord-{}", order.client_order_id),
                    status: "accepted".into(),
                },
            })
        }
    }

    fn manager() -> (Arc<TradeManager>, AccountStore, LiveState, EventBus) {
        let ledger = TradeLedger::open_in_memory().unwrap();
        let account = AccountStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let state = LiveState::new();
        let executor = Arc::new(TradeExecutor::new(Arc::new(AckBroker)));
        let manager = TradeManager::new(
            ledger,
            account.clone(),
            executor,
            bus.clone(),
            Notifier::disabled(),
            state.clone(),
        );
        (manager, account, state, bus)
    }

    fn open_ticket(ticket_id: &str) -> TradeTicket {
        TradeTicket {
            ticket_id: ticket_id.into(),
            intent: TicketIntent::Open,
            close_trade_id: None,
            date: "2026-01-17".into(),
            time: "14:05:09".into(),
            symbol: "BTC".into(),
            market: "Kalshi".into(),
            trade_strategy: "Hourly HTC".into(),
            contract: "BTC 3pm".into(),
            strike: 119_000.0,
            side: Side::Yes,
            ticker: "T-119000".into(),
            buy_price: 0.93,
            sell_price: None,
            position: 3,
            prob: Some(95.5),
            symbol_open: Some(119_050.0),
            symbol_close: None,
            momentum: Some(5),
            entry_method: EntryMethod::Auto,
            close_method: None,
        }
    }

    fn live_position(ticker: &str, count: i64, exposure_cc: f64, fees: f64) -> PositionRow {
        PositionRow {
            ticker: ticker.into(),
            total_traded: 2.79,
            position: count,
            market_exposure: exposure_cc,
            realized_pnl: 0.0,
            fees_paid: fees,
            last_updated_ts: 0,
            raw: "{}".into(),
        }
    }

    #[tokio::test]
    async fn open_confirmation_reads_mirror_economics() {
        let (manager, account, state, _bus) = manager();
        state.set_price(crate::models::PricePoint {
            ts: 0,
            price: 119_055.0,
        });

        let id = manager.open_trade(open_ticket("TICKET-open")).await.unwrap();

        // Mirror the broker position: 3 contracts, 27900 centi-cents, fees 0.20.
        account
            .upsert_position(&live_position("T-119000", 3, 27_900.0, 0.20))
            .await
            .unwrap();

        // Drive one confirmation pass directly.
        let ticket = open_ticket("TICKET-open");
        assert!(manager.try_confirm_open(id, &ticket).await.unwrap());

        let trade = manager.ledger().get(id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.position, 3);
        assert_eq!(trade.buy_price, 0.93);
        assert_eq!(trade.fees, Some(0.20));
        // diff = round_ties_even(95.5 - 93) = 2.
        assert_eq!(trade.diff, Some(2));
        assert_eq!(trade.symbol_open, Some(119_055.0));
    }

    #[tokio::test]
    async fn close_confirmation_prices_from_opposite_fill() {
        let (manager, account, state, _bus) = manager();
        state.set_price(crate::models::PricePoint {
            ts: 0,
            price: 118_800.0,
        });

        let id = manager.open_trade(open_ticket("TICKET-close")).await.unwrap();
        account
            .upsert_position(&live_position("T-119000", 3, 27_900.0, 0.20))
            .await
            .unwrap();
        let ticket = open_ticket("TICKET-close");
        manager.try_confirm_open(id, &ticket).await.unwrap();

        // Close ticket: side inverted by the initiator.
        let mut close = open_ticket("TICKET-close-2");
        close.intent = TicketIntent::Close;
        close.close_trade_id = Some(id);
        close.side = Side::No;
        close.sell_price = Some(0.06);
        manager.close_trade(close).await.unwrap();

        let trade = manager.ledger().get(id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closing);

        // Position zeroes out; the closing fill bought NO at 0.94.
        account
            .upsert_position(&live_position("T-119000", 0, 0.0, 0.30))
            .await
            .unwrap();
        account
            .insert_fill(&FillRow {
                trade_id: "f-close".into(),
                ticker: "T-119000".into(),
                order_id: "o-close".into(),
                side: "no".into(),
                action: "buy".into(),
                count: 3,
                yes_price: 0.06,
                no_price: 0.94,
                is_taker: true,
                created_time: "2026-01-17T19:59:58Z".into(),
            })
            .await
            .unwrap();

        manager.on_positions_changed().await;

        let trade = manager.ledger().get(id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.sell_price, Some(0.06));
        assert_eq!(trade.fees, Some(0.30));
        assert_eq!(trade.pnl, Some(-2.91));
        assert_eq!(trade.win_loss, Some(WinLoss::Loss));
        assert_eq!(trade.symbol_close, Some(118_800.0));
    }

    #[tokio::test]
    async fn expiry_then_settlement_closes_the_trade() {
        let (manager, account, _state, _bus) = manager();

        let id = manager.open_trade(open_ticket("TICKET-exp")).await.unwrap();
        account
            .upsert_position(&live_position("T-119000", 3, 27_900.0, 0.20))
            .await
            .unwrap();
        let ticket = open_ticket("TICKET-exp");
        manager.try_confirm_open(id, &ticket).await.unwrap();

        manager.run_expiry_cycle().await.unwrap();
        let trade = manager.ledger().get(id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Expired);
        assert_eq!(trade.close_method.as_deref(), Some("expired"));

        // Winning settlement arrives.
        account
            .insert_settlement(&crate::store::account::SettlementRow {
                ticker: "T-119000".into(),
                market_result: "yes".into(),
                revenue: 100.0,
                yes_count: 3,
                no_count: 0,
                settled_time: "2026-01-17T20:00:05Z".into(),
            })
            .await
            .unwrap();

        assert!(manager.settle_one("T-119000").await.unwrap());
        let trade = manager.ledger().get(id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.sell_price, Some(1.0));
        // pnl = 3*1 - 3*0.93 - 0.20 = 0.01 -> win.
        assert_eq!(trade.pnl, Some(0.01));
        assert_eq!(trade.win_loss, Some(WinLoss::Win));
    }

    #[tokio::test]
    async fn close_for_unknown_trade_is_a_logged_noop() {
        let (manager, _account, _state, _bus) = manager();
        let mut close = open_ticket("TICKET-ghost");
        close.intent = TicketIntent::Close;
        close.close_trade_id = Some(777);
        assert!(manager.close_trade(close).await.is_ok());
    }
}
