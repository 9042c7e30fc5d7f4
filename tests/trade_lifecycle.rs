//! End-to-end lifecycle tests over in-memory stores and a scripted broker.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use strikebot::auto_entry::AutoEntrySupervisor;
use strikebot::broker::types::*;
use strikebot::broker::BrokerApi;
use strikebot::bus::{EventBus, Notifier};
use strikebot::config::{AutoEntrySettings, TradePreferences};
use strikebot::models::{
    EntryMethod, MarketQuote, MarketSnapshot, PricePoint, Side, StrikeRow, StrikeTableDoc,
    TradeStatus, WinLoss,
};
use strikebot::prob::ProbabilityTable;
use strikebot::state::LiveState;
use strikebot::store::account::{AccountStore, FillRow, PositionRow, SettlementRow};
use strikebot::store::active::ActiveTradeStore;
use strikebot::store::ledger::TradeLedger;
use strikebot::store::settings::SettingsStore;
use strikebot::trade::executor::TradeExecutor;
use strikebot::trade::initiator::TradeInitiator;
use strikebot::trade::manager::TradeManager;
use strikebot::trade::monitor::ActiveTradeSupervisor;

/// Broker double: acks every order and records it.
#[derive(Default)]
struct ScriptedBroker {
    orders: Mutex<Vec<OrderRequest>>,
}

#[async_trait]
impl BrokerApi for ScriptedBroker {
    async fn get_event(&self, _: &str) -> Result<EventResponse> {
        Err(anyhow::anyhow!("not scripted"))
    }
    async fn get_balance(&self) -> Result<BalanceResponse> {
        Ok(BalanceResponse { balance: 100_000 })
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
        self.orders.lock().push(order.clone());
        Ok(OrderResponse {
            order: OrderAck {
                order_id: format!("ord-{}", self.orders.lock().len()),
                status: "accepted".into(),
            },
        })
    }
}

struct Harness {
    broker: Arc<ScriptedBroker>,
    ledger: TradeLedger,
    account: AccountStore,
    active: ActiveTradeStore,
    settings: SettingsStore,
    state: LiveState,
    manager: Arc<TradeManager>,
    initiator: Arc<TradeInitiator>,
    monitor: Arc<ActiveTradeSupervisor>,
    auto_entry: Arc<AutoEntrySupervisor>,
    _artifact_dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let broker = Arc::new(ScriptedBroker::default());
    let ledger = TradeLedger::open_in_memory().unwrap();
    let account = AccountStore::open_in_memory().unwrap();
    let active = ActiveTradeStore::open_in_memory().unwrap();
    let settings = SettingsStore::open_in_memory().unwrap();
    let state = LiveState::new();
    let bus = EventBus::new();
    let artifact_dir = tempfile::tempdir().unwrap();

    // Flat 95.5% surface; keys outside the grid clamp in.
    let mut prob_table = ProbabilityTable::open_in_memory().unwrap();
    for ttc in (5..=900).step_by(5) {
        for buffer in (10..=500).step_by(10) {
            prob_table.insert_row(ttc, buffer, 0, 95.5, 95.5).await.unwrap();
        }
    }
    prob_table.reload_domain().await.unwrap();

    let executor = Arc::new(TradeExecutor::new(broker.clone()));
    let manager = TradeManager::new(
        ledger.clone(),
        account.clone(),
        executor,
        bus.clone(),
        Notifier::disabled(),
        state.clone(),
    );
    let initiator = TradeInitiator::new(
        manager.clone(),
        state.clone(),
        settings.clone(),
        "BTC".into(),
        "Kalshi".into(),
    );
    let monitor = ActiveTradeSupervisor::new(
        active.clone(),
        ledger.clone(),
        state.clone(),
        prob_table,
        initiator.clone(),
        settings.clone(),
        bus.clone(),
        artifact_dir.path().to_path_buf(),
    );
    monitor.start();

    let auto_entry = AutoEntrySupervisor::new(
        settings.clone(),
        state.clone(),
        active.clone(),
        ledger.clone(),
        initiator.clone(),
        bus.clone(),
        Notifier::disabled(),
    );

    Harness {
        broker,
        ledger,
        account,
        active,
        settings,
        state,
        manager,
        initiator,
        monitor,
        auto_entry,
        _artifact_dir: artifact_dir,
    }
}

fn entry_settings() -> AutoEntrySettings {
    AutoEntrySettings {
        enabled: true,
        min_probability: 90.0,
        min_differential: 2.0,
        min_time: 60,
        max_time: 1800,
        allow_re_entry: true,
        spike_alert_enabled: true,
        spike_alert_momentum_threshold: 20.0,
        spike_alert_cooldown_threshold: 10.0,
        spike_alert_cooldown_minutes: 2.0,
    }
}

fn snapshot(ttc_seconds: i64) -> MarketSnapshot {
    MarketSnapshot {
        event_ticker: "KXBTCD-26JAN1715".into(),
        event_title: "BTC price at 3pm EST".into(),
        strike_date: chrono::Utc::now() + chrono::Duration::seconds(ttc_seconds),
        market_status: "active".into(),
        strike_tier: 250,
        markets: vec![MarketQuote {
            ticker: "KXBTCD-26JAN1715-T119000".into(),
            floor_strike: 118_999.99,
            strike: 119_000,
            yes_bid: 91,
            yes_ask: 93,
            no_bid: 5,
            no_ask: 7,
            last_price: 92,
            volume: 1500,
            volume_24h: 6000,
            open_interest: 300,
        }],
        fetched_at: chrono::Utc::now().timestamp(),
    }
}

fn watchlist_row() -> StrikeRow {
    StrikeRow {
        strike: 119_000,
        buffer: 50.0,
        buffer_pct: 0.2,
        probability: 95.5,
        yes_ask: 93.0,
        no_ask: 7.0,
        yes_diff: 2.5,
        no_diff: -2.5,
        volume: 1500,
        ticker: "KXBTCD-26JAN1715-T119000".into(),
        active_side: Side::Yes,
    }
}

fn watchlist_doc() -> StrikeTableDoc {
    StrikeTableDoc {
        symbol: "BTC".into(),
        current_price: 119_050.0,
        ttc: 600,
        broker: "Kalshi".into(),
        event_ticker: "KXBTCD-26JAN1715".into(),
        market_title: "BTC price at 3pm EST".into(),
        strike_tier: 250,
        market_status: "active".into(),
        last_updated: chrono::Utc::now().to_rfc3339(),
        strikes: vec![watchlist_row()],
    }
}

fn mirror_position(ticker: &str, count: i64, exposure_cc: f64, fees: f64) -> PositionRow {
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

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_entry_happy_path_with_cooldown() {
    let h = harness().await;

    h.settings.set_auto_entry_settings(&entry_settings()).await.unwrap();
    h.settings
        .set_trade_preferences(&TradePreferences {
            position_size: 2,
            multiplier: 1,
            trade_strategy: "Hourly HTC".into(),
            auto_stop_threshold: None,
        })
        .await
        .unwrap();

    h.state.set_price(PricePoint {
        ts: chrono::Utc::now().timestamp(),
        price: 119_050.0,
    });
    h.state.set_momentum(5.0);
    h.state.set_snapshot(snapshot(600));
    h.state.set_watchlist(watchlist_doc());

    h.auto_entry.scan().await.unwrap();

    let pending = h.ledger.by_status(TradeStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    let trade = &pending[0];
    assert_eq!(trade.side, Side::Yes);
    assert_eq!(trade.buy_price, 0.93);
    assert_eq!(trade.prob, Some(95.5));
    assert_eq!(trade.position, 2);
    assert_eq!(trade.entry_method, EntryMethod::Auto);
    assert_eq!(trade.symbol_open, Some(119_050.0));

    // The executor receives the market buy.
    let broker = h.broker.clone();
    wait_until("order submission", || {
        let broker = broker.clone();
        async move { !broker.orders.lock().is_empty() }
    })
    .await;
    let order = h.broker.orders.lock()[0].clone();
    assert_eq!(order.side, "yes");
    assert_eq!(order.count, 2);
    assert_eq!(order.action, "buy");

    // Identical inputs within the cooldown window: nothing new is emitted.
    h.auto_entry.scan().await.unwrap();
    assert_eq!(h.ledger.by_status(TradeStatus::Pending).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_settings_emit_nothing() {
    let h = harness().await;
    h.state.set_price(PricePoint {
        ts: chrono::Utc::now().timestamp(),
        price: 119_050.0,
    });
    h.state.set_momentum(5.0);
    h.state.set_snapshot(snapshot(600));
    h.state.set_watchlist(watchlist_doc());

    // No settings at all.
    h.auto_entry.scan().await.unwrap();
    assert!(h.ledger.by_status(TradeStatus::Pending).await.unwrap().is_empty());
    assert!(h.broker.orders.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn open_close_lifecycle_mirrors_active_trades() {
    let h = harness().await;
    h.state.set_price(PricePoint {
        ts: chrono::Utc::now().timestamp(),
        price: 119_050.0,
    });
    h.state.set_snapshot(snapshot(600));

    let (id, _ticket) = h
        .initiator
        .open(strikebot::models::OpenTradeRequest {
            strike: 119_000.0,
            side: Side::Yes,
            ticker: "KXBTCD-26JAN1715-T119000".into(),
            buy_price: 0.93,
            prob: 95.5,
            position: Some(3),
            contract: None,
            symbol: None,
            market: None,
            entry_method: EntryMethod::Manual,
        })
        .await
        .unwrap();

    // Broker position materializes; the 1 Hz confirmation watcher flips the
    // trade open and the supervisor mirrors it.
    h.account
        .upsert_position(&mirror_position("KXBTCD-26JAN1715-T119000", 3, 27_900.0, 0.20))
        .await
        .unwrap();

    let ledger = h.ledger.clone();
    wait_until("open confirmation", || {
        let ledger = ledger.clone();
        async move {
            matches!(
                ledger.get(id).await,
                Ok(Some(trade)) if trade.status == TradeStatus::Open
            )
        }
    })
    .await;

    let trade = h.ledger.get(id).await.unwrap().unwrap();
    assert_eq!(trade.buy_price, 0.93);
    assert_eq!(trade.diff, Some(2));

    let active = h.active.clone();
    wait_until("active trade mirror", || {
        let active = active.clone();
        async move { matches!(active.count().await, Ok(1)) }
    })
    .await;

    // Close: position zeroes, the closing fill bought NO at 0.94.
    h.initiator.close(id, 0.06, "manual").await.unwrap();
    h.account
        .upsert_position(&mirror_position("KXBTCD-26JAN1715-T119000", 0, 0.0, 0.30))
        .await
        .unwrap();
    h.account
        .insert_fill(&FillRow {
            trade_id: "fill-close".into(),
            ticker: "KXBTCD-26JAN1715-T119000".into(),
            order_id: "o-2".into(),
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
    h.manager.on_positions_changed().await;

    let trade = h.ledger.get(id).await.unwrap().unwrap();
    assert_eq!(trade.status, TradeStatus::Closed);
    assert_eq!(trade.sell_price, Some(0.06));
    assert_eq!(trade.fees, Some(0.30));
    assert_eq!(trade.pnl, Some(-2.91));
    assert_eq!(trade.win_loss, Some(WinLoss::Loss));

    // The monitoring row follows the trade out of `open`.
    let active = h.active.clone();
    wait_until("active trade removal", || {
        let active = active.clone();
        async move { matches!(active.count().await, Ok(0)) }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn expiry_and_settlement_resolution() {
    let h = harness().await;
    h.state.set_price(PricePoint {
        ts: chrono::Utc::now().timestamp(),
        price: 119_200.0,
    });
    h.state.set_snapshot(snapshot(600));

    let (id, _ticket) = h
        .initiator
        .open(strikebot::models::OpenTradeRequest {
            strike: 119_000.0,
            side: Side::Yes,
            ticker: "KXBTCD-26JAN1715-T119000".into(),
            buy_price: 0.93,
            prob: 95.5,
            position: Some(3),
            contract: None,
            symbol: None,
            market: None,
            entry_method: EntryMethod::Manual,
        })
        .await
        .unwrap();
    h.account
        .upsert_position(&mirror_position("KXBTCD-26JAN1715-T119000", 3, 27_900.0, 0.20))
        .await
        .unwrap();

    let ledger = h.ledger.clone();
    wait_until("open confirmation", || {
        let ledger = ledger.clone();
        async move {
            matches!(
                ledger.get(id).await,
                Ok(Some(trade)) if trade.status == TradeStatus::Open
            )
        }
    })
    .await;

    // Hourly boundary: the open trade expires.
    h.manager.run_expiry_cycle().await.unwrap();
    let trade = h.ledger.get(id).await.unwrap().unwrap();
    assert_eq!(trade.status, TradeStatus::Expired);
    assert_eq!(trade.close_method.as_deref(), Some("expired"));
    assert_eq!(trade.symbol_close, Some(119_200.0));

    // Settlement with positive revenue resolves to a win at sell price 1.
    h.account
        .insert_settlement(&SettlementRow {
            ticker: "KXBTCD-26JAN1715-T119000".into(),
            market_result: "yes".into(),
            revenue: 1.0,
            yes_count: 3,
            no_count: 0,
            settled_time: "2026-01-17T20:00:05Z".into(),
        })
        .await
        .unwrap();

    let ledger = h.ledger.clone();
    wait_until("settlement resolution", || {
        let ledger = ledger.clone();
        async move {
            matches!(
                ledger.get(id).await,
                Ok(Some(trade)) if trade.status == TradeStatus::Closed
            )
        }
    })
    .await;

    let trade = h.ledger.get(id).await.unwrap().unwrap();
    assert_eq!(trade.sell_price, Some(1.0));
    assert_eq!(trade.pnl, Some(0.01));
    assert_eq!(trade.win_loss, Some(WinLoss::Win));
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_strike_is_skipped_while_trade_lives() {
    let h = harness().await;
    h.settings.set_auto_entry_settings(&entry_settings()).await.unwrap();
    h.settings
        .set_trade_preferences(&TradePreferences {
            position_size: 1,
            multiplier: 1,
            trade_strategy: "Hourly HTC".into(),
            auto_stop_threshold: None,
        })
        .await
        .unwrap();
    h.state.set_price(PricePoint {
        ts: chrono::Utc::now().timestamp(),
        price: 119_050.0,
    });
    h.state.set_momentum(5.0);
    h.state.set_snapshot(snapshot(600));
    h.state.set_watchlist(watchlist_doc());

    h.auto_entry.scan().await.unwrap();
    assert_eq!(h.ledger.by_status(TradeStatus::Pending).await.unwrap().len(), 1);

    // Further scans are rejected twice over: the cooldown holds the key and
    // the pending trade trips the duplicate guard.
    h.auto_entry.scan().await.unwrap();
    h.auto_entry.scan().await.unwrap();
    assert_eq!(h.ledger.by_status(TradeStatus::Pending).await.unwrap().len(), 1);
    assert_eq!(h.monitor.active_trades().await.unwrap().len(), 0);
}
