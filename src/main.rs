//! Strikebot: automated execution engine for hourly strike markets.
//!
//! One process, many cooperative workers: price feed, market snapshots,
//! orderbook deltas, strike-table generation, auto entry, the trade
//! lifecycle (initiator / manager / executor / monitor / expiry), account
//! sync, and the HTTP surface that doubles as the bus's cross-process
//! transport.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strikebot::account_sync::AccountSync;
use strikebot::api::{self, ApiState};
use strikebot::auto_entry::AutoEntrySupervisor;
use strikebot::broker::{BrokerApi, KalshiClient, RequestSigner};
use strikebot::bus::{EventBus, Notifier};
use strikebot::config::Config;
use strikebot::feeds::market_snapshot::MarketSnapshotWorker;
use strikebot::feeds::orderbook::OrderbookConsumer;
use strikebot::feeds::price_feed::PriceFeed;
use strikebot::models::BusEvent;
use strikebot::prob::ProbabilityTable;
use strikebot::state::LiveState;
use strikebot::store::account::AccountStore;
use strikebot::store::active::ActiveTradeStore;
use strikebot::store::ledger::TradeLedger;
use strikebot::store::settings::SettingsStore;
use strikebot::store::ticks::TickStore;
use strikebot::strike_table::StrikeTableGenerator;
use strikebot::trade::executor::TradeExecutor;
use strikebot::trade::expiry::ExpiryScheduler;
use strikebot::trade::initiator::TradeInitiator;
use strikebot::trade::manager::TradeManager;
use strikebot::trade::monitor::ActiveTradeSupervisor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,strikebot=debug,hyper=warn,tungstenite=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        symbol = %config.symbol,
        mode = config.account_mode.as_str(),
        port = config.port,
        "strikebot starting"
    );

    // Stores share one database file; each owns its connection.
    let ticks = TickStore::new(&config.database_path)?;
    let ledger = TradeLedger::new(&config.database_path)?;
    let account = AccountStore::new(&config.database_path)?;
    let active = ActiveTradeStore::new(&config.database_path)?;
    let settings = SettingsStore::new(&config.database_path)?;

    // The probability surface is generated offline; running without it is a
    // fatal misconfiguration, not something to default around.
    let prob_table = ProbabilityTable::open(&config.prob_table_path)
        .with_context(|| format!("probability table at {}", config.prob_table_path))?;

    let state = LiveState::new();
    let bus = EventBus::new();
    let notifier = Notifier::new(config.notify_peers.clone());

    // Broker credentials gate everything that talks to the exchange.
    let signer = match (&config.broker_key_id, &config.broker_key_path) {
        (Some(key_id), Some(key_path)) => {
            RequestSigner::from_pem_file(key_id, key_path).context("load broker credentials")?
        }
        _ => {
            return Err(anyhow!(
                "BROKER_API_KEY_ID and BROKER_PRIVATE_KEY_PATH are required"
            ))
        }
    };
    let broker: Arc<dyn BrokerApi> =
        Arc::new(KalshiClient::new(config.account_mode, signer.clone())?);

    // Trade lifecycle wiring, leaf first.
    let executor = Arc::new(TradeExecutor::new(broker.clone()));
    let manager = TradeManager::new(
        ledger.clone(),
        account.clone(),
        executor,
        bus.clone(),
        notifier.clone(),
        state.clone(),
    );
    let initiator = TradeInitiator::new(
        manager.clone(),
        state.clone(),
        settings.clone(),
        config.symbol.clone(),
        "Kalshi".to_string(),
    );
    let monitor = ActiveTradeSupervisor::new(
        active.clone(),
        ledger.clone(),
        state.clone(),
        prob_table.clone(),
        initiator.clone(),
        settings.clone(),
        bus.clone(),
        config.artifact_dir("active_trades")?,
    );
    let _ = monitor.start();
    monitor.sync_with_ledger().await;

    let auto_entry = AutoEntrySupervisor::new(
        settings.clone(),
        state.clone(),
        active.clone(),
        ledger.clone(),
        initiator.clone(),
        bus.clone(),
        notifier.clone(),
    );
    let _ = auto_entry.clone().spawn();

    // Market data workers.
    let _ = PriceFeed::new(
        config.ticker_ws_url.clone(),
        config.product_id.clone(),
        config.symbol.clone(),
        ticks.clone(),
        state.clone(),
        bus.clone(),
    )
    .spawn();

    let _ = MarketSnapshotWorker::new(
        broker.clone(),
        format!("KX{}D", config.symbol.to_uppercase()),
        state.clone(),
        bus.clone(),
        settings.clone(),
    )
    .spawn();

    let _ = OrderbookConsumer::new(
        config.account_mode.ws_url().to_string(),
        signer.clone(),
        state.clone(),
        config.artifact_dir("orderbook")?,
    )
    .spawn();

    let _ = StrikeTableGenerator::new(
        config.symbol.clone(),
        state.clone(),
        prob_table,
        settings.clone(),
        bus.clone(),
        config.artifact_dir("strike_tables")?,
        config.artifact_dir("live_probabilities")?,
    )
    .spawn();

    // Account sync with its WebSocket trigger.
    let _ = AccountSync::new(
        broker,
        account.clone(),
        bus.clone(),
        notifier,
        Some((config.account_mode.ws_url().to_string(), signer)),
    )
    .start();

    // Positions / fills change events drive pending and closing resolution.
    {
        let manager = manager.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(BusEvent::DbChanged { db_name })
                        if db_name == "positions" || db_name == "fills" =>
                    {
                        manager.on_positions_changed().await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "manager bridge lagged; forcing reconcile");
                        manager.on_positions_changed().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let _ = ExpiryScheduler::new(manager.clone()).spawn();

    let api_state = ApiState {
        live: state,
        ledger,
        account,
        settings,
        manager,
        initiator,
        monitor,
        auto_entry,
        bus,
        symbol: config.symbol.clone(),
    };
    let app = api::router(api_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "http surface listening");
    axum::serve(listener, app).await.context("serve http")?;
    Ok(())
}
