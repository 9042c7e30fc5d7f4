//! Active-trade supervisor.
//!
//! Mirrors every `open` ledger trade into the monitoring table, runs a 1 Hz
//! telemetry loop while any row exists (live PnL, buffer from strike,
//! current probability, time since entry), and drives auto-stop exits via
//! the initiator's close path. The loop starts with the first active trade
//! and stops when the table empties.

use anyhow::Result;
use chrono::{NaiveDateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::artifacts::write_json_atomic;
use crate::bus::EventBus;
use crate::models::{ActiveTrade, ActiveTradesDoc, BusEvent, Side, TradeStatus, EXCHANGE_TZ};
use crate::prob::ProbabilityTable;
use crate::state::LiveState;
use crate::store::active::ActiveTradeStore;
use crate::store::ledger::TradeLedger;
use crate::store::settings::SettingsStore;
use crate::trade::initiator::TradeInitiator;

pub struct ActiveTradeSupervisor {
    active: ActiveTradeStore,
    ledger: TradeLedger,
    state: LiveState,
    prob_table: ProbabilityTable,
    initiator: Arc<TradeInitiator>,
    settings: SettingsStore,
    bus: EventBus,
    artifact_path: PathBuf,
    loop_running: AtomicBool,
}

impl ActiveTradeSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        active: ActiveTradeStore,
        ledger: TradeLedger,
        state: LiveState,
        prob_table: ProbabilityTable,
        initiator: Arc<TradeInitiator>,
        settings: SettingsStore,
        bus: EventBus,
        artifact_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            active,
            ledger,
            state,
            prob_table,
            initiator,
            settings,
            bus,
            artifact_path: artifact_dir.join("active_trades.json"),
            loop_running: AtomicBool::new(false),
        })
    }

    /// Listen for trade lifecycle events and keep the mirror in sync.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(BusEvent::TradeChanged {
                        trade_id, status, ..
                    }) => {
                        supervisor.handle_trade_change(trade_id, status).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        // Dropped events are covered by the periodic sync below.
                        debug!(skipped, "active-trade supervisor lagged on bus");
                        supervisor.sync_with_ledger().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Direct notification entry point (HTTP RPC from the manager).
    pub async fn handle_trade_change(self: &Arc<Self>, trade_id: i64, status: TradeStatus) {
        match status {
            TradeStatus::Open => {
                match self.ledger.get(trade_id).await {
                    Ok(Some(trade)) => {
                        match self.active.insert_from_trade(&trade).await {
                            Ok(true) => {
                                info!(trade_id, "active trade added to monitoring");
                                self.export().await;
                            }
                            Ok(false) => {}
                            Err(e) => warn!(trade_id, error = %e, "active trade insert failed"),
                        }
                        self.ensure_monitor_loop();
                    }
                    Ok(None) => warn!(trade_id, "open notification for unknown trade"),
                    Err(e) => warn!(trade_id, error = %e, "ledger read failed"),
                }
            }
            // Any exit from `open` removes the monitoring row.
            TradeStatus::Closing
            | TradeStatus::Closed
            | TradeStatus::Expired
            | TradeStatus::Error => {
                match self.active.remove(trade_id).await {
                    Ok(true) => {
                        info!(trade_id, status = status.as_str(), "active trade removed");
                        self.export().await;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(trade_id, error = %e, "active trade removal failed"),
                }
            }
            TradeStatus::Pending => {}
        }
    }

    /// Reconcile the mirror against the ledger (startup and lag recovery):
    /// a row exists iff the ledger trade is `open`.
    pub async fn sync_with_ledger(self: &Arc<Self>) {
        let open = match self.ledger.by_status(TradeStatus::Open).await {
            Ok(trades) => trades,
            Err(e) => {
                warn!(error = %e, "ledger sync read failed");
                return;
            }
        };
        for trade in &open {
            self.active.insert_from_trade(trade).await.ok();
        }
        if let Ok(rows) = self.active.all().await {
            for row in rows {
                if !open.iter().any(|t| t.id == row.trade_id) {
                    self.active.remove(row.trade_id).await.ok();
                }
            }
        }
        if matches!(self.active.count().await, Ok(n) if n > 0) {
            self.ensure_monitor_loop();
        }
        self.export().await;
    }

    fn ensure_monitor_loop(self: &Arc<Self>) {
        if self
            .loop_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let supervisor = self.clone();
        tokio::spawn(async move {
            info!("active-trade monitoring loop started");
            let mut tick = interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                match supervisor.active.count().await {
                    Ok(0) => break,
                    Ok(_) => {
                        if let Err(e) = supervisor.update_pass().await {
                            warn!(error = %e, "monitoring pass failed");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "active count read failed");
                        break;
                    }
                }
            }
            supervisor.loop_running.store(false, Ordering::SeqCst);
            supervisor.export().await;
            info!("active-trade monitoring loop stopped (no active trades)");
        });
    }

    /// One 1 Hz telemetry pass over every monitored trade.
    async fn update_pass(self: &Arc<Self>) -> Result<()> {
        let Some(point) = self.state.price() else {
            return Ok(());
        };
        let Some(snapshot) = self.state.snapshot() else {
            return Ok(());
        };
        let momentum = self.state.momentum().unwrap_or(0.0);
        let now = Utc::now();
        let ttc_seconds = snapshot.ttc_seconds(now);
        let stop_threshold = self
            .settings
            .trade_preferences()
            .await?
            .and_then(|p| p.auto_stop_threshold);

        for row in self.active.all().await? {
            let Some(market) = snapshot.market_for_ticker(&row.ticker) else {
                debug!(trade_id = row.trade_id, "no market quote for active trade");
                continue;
            };
            // Cost to close is the opposite side's ask.
            let close_ask = match row.side {
                Side::Yes => market.no_ask,
                Side::No => market.yes_ask,
            };
            let current_close_price = close_ask as f64 / 100.0;

            let buffer_from_entry = match row.side {
                Side::Yes => point.price - row.strike,
                Side::No => row.strike - point.price,
            };

            let time_since_entry =
                seconds_since_entry(&row.date, &row.time, now.timestamp()).unwrap_or(0);

            let current_probability = self
                .prob_table
                .prob_for_strike(row.strike, point.price, ttc_seconds as f64, momentum)
                .await?;

            let current_pnl = 1.0 - current_close_price - row.buy_price;
            let pnl_formatted = format!("{current_pnl:.2}");

            self.active
                .update_monitoring(
                    row.trade_id,
                    point.price,
                    current_probability,
                    buffer_from_entry,
                    time_since_entry,
                    current_close_price,
                    &pnl_formatted,
                    &now.to_rfc3339(),
                )
                .await?;

            if let Some(threshold) = stop_threshold {
                if current_pnl <= threshold {
                    info!(
                        trade_id = row.trade_id,
                        current_pnl, threshold, "auto-stop tripped, closing trade"
                    );
                    if let Err(e) = self
                        .initiator
                        .close(row.trade_id, current_close_price, "auto-stop")
                        .await
                    {
                        warn!(trade_id = row.trade_id, error = %e, "auto-stop close failed");
                    }
                }
            }
        }

        self.export().await;
        self.state.heartbeat("active_trade_supervisor");
        Ok(())
    }

    pub async fn active_trades(&self) -> Result<Vec<ActiveTrade>> {
        self.active.all().await
    }

    async fn export(&self) {
        let trades = self.active.all().await.unwrap_or_default();
        let doc = ActiveTradesDoc {
            timestamp: Utc::now().to_rfc3339(),
            count: trades.len(),
            active_trades: trades,
        };
        if let Err(e) = write_json_atomic(&self.artifact_path, &doc) {
            warn!(error = %e, "active trades export failed");
        }
        self.bus.publish(BusEvent::DbChanged {
            db_name: "active_trades".to_string(),
        });
    }
}

/// Seconds elapsed since an exchange-timezone entry stamp.
fn seconds_since_entry(date: &str, time: &str, now_ts: i64) -> Option<i64> {
    let naive =
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S").ok()?;
    let entry = naive.and_local_timezone(EXCHANGE_TZ).single()?;
    Some((now_ts - entry.timestamp()).max(0))
}
