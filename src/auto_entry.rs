//! Auto-entry supervisor.
//!
//! Scans the watchlist once per second and emits open tickets when entry
//! criteria hold. Owns the TTC window gate, the spike-alert pause state
//! machine, a compare-and-set per-strike cooldown map, and the duplicate
//! trade guard. Missing required settings mean `DISABLED`, never defaults.

use anyhow::Result;
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Notifier};
use crate::config::AutoEntrySettings;
use crate::models::{
    AutoEntryIndicator, BusEvent, EntryMethod, OpenTradeRequest, Side, StrikeRow, TradeStatus,
};
use crate::state::LiveState;
use crate::store::active::ActiveTradeStore;
use crate::store::ledger::TradeLedger;
use crate::store::settings::SettingsStore;
use crate::trade::initiator::TradeInitiator;

/// Seconds a strike key stays on cooldown after an attempt.
const TRADE_COOLDOWN_SECS: i64 = 10;

/// Entry leniency below the configured differential, half a point.
const DIFFERENTIAL_LENIENCY: f64 = 0.5;

/// Operational state reported to the UI and health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Feature off, required settings missing, or service unhealthy.
    Disabled,
    /// Enabled but TTC outside the configured window.
    Inactive,
    /// Scanning the watchlist.
    Active,
    /// Spike alert engaged; all emission blocked.
    Paused,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Disabled => "disabled",
            SupervisorState::Inactive => "inactive",
            SupervisorState::Active => "active",
            SupervisorState::Paused => "paused",
        }
    }
}

/// Spike-alert sub-state. `clock_start` doubles as the spike start and the
/// recovery clock: any momentum at or above the cooldown threshold resets it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpikeState {
    pub active: bool,
    pub clock_start: Option<i64>,
    pub momentum_value: Option<f64>,
}

/// Advance the spike state machine one tick. Returns whether emission is
/// blocked after this tick.
pub fn evaluate_spike(
    state: &mut SpikeState,
    settings: &AutoEntrySettings,
    momentum: f64,
    now_ts: i64,
) -> bool {
    if !settings.spike_alert_enabled {
        *state = SpikeState::default();
        return false;
    }

    let spike_detected = momentum.abs() >= settings.spike_alert_momentum_threshold;
    let recovered = momentum.abs() < settings.spike_alert_cooldown_threshold;
    let cooldown_secs = (settings.spike_alert_cooldown_minutes * 60.0) as i64;

    if spike_detected && !state.active {
        state.active = true;
        state.clock_start = Some(now_ts);
        state.momentum_value = Some(momentum);
        info!(momentum, "spike detected, auto entry paused");
    } else if state.active {
        if recovered {
            match state.clock_start {
                Some(start) if now_ts - start >= cooldown_secs => {
                    *state = SpikeState::default();
                    info!("spike recovery complete, auto entry resumed");
                }
                Some(_) => {}
                None => state.clock_start = Some(now_ts),
            }
        } else {
            // Still at or above the cooldown threshold: recovery restarts.
            state.clock_start = Some(now_ts);
            state.momentum_value = Some(momentum);
        }
    }

    state.active
}

pub struct AutoEntrySupervisor {
    settings: SettingsStore,
    state: LiveState,
    active: ActiveTradeStore,
    ledger: TradeLedger,
    initiator: Arc<TradeInitiator>,
    bus: EventBus,
    notifier: Notifier,
    cooldowns: SyncMutex<HashMap<(i64, Side), i64>>,
    spike: SyncMutex<SpikeState>,
    last_indicator: SyncMutex<Option<AutoEntryIndicator>>,
    operational: SyncMutex<SupervisorState>,
}

impl AutoEntrySupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: SettingsStore,
        state: LiveState,
        active: ActiveTradeStore,
        ledger: TradeLedger,
        initiator: Arc<TradeInitiator>,
        bus: EventBus,
        notifier: Notifier,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            state,
            active,
            ledger,
            initiator,
            bus,
            notifier,
            cooldowns: SyncMutex::new(HashMap::new()),
            spike: SyncMutex::new(SpikeState::default()),
            last_indicator: SyncMutex::new(None),
            operational: SyncMutex::new(SupervisorState::Disabled),
        })
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                if let Err(e) = self.scan().await {
                    warn!(error = %e, "auto entry scan failed");
                }
            }
        })
    }

    pub fn operational_state(&self) -> SupervisorState {
        *self.operational.lock()
    }

    /// One 1 Hz evaluation: recompute the operational state, broadcast the
    /// indicator on change, and emit tickets while `ACTIVE`.
    pub async fn scan(self: &Arc<Self>) -> Result<()> {
        let now_ts = chrono::Utc::now().timestamp();
        self.cleanup_cooldowns(now_ts);
        self.state.heartbeat("auto_entry");

        let momentum = self.state.momentum();
        let ttc = self
            .state
            .snapshot()
            .map(|s| s.ttc_seconds(chrono::Utc::now()));

        let Some(settings) = self.settings.auto_entry_settings().await? else {
            // Required settings missing: nothing is emitted, full stop.
            self.set_state_and_broadcast(SupervisorState::Disabled, None, momentum, ttc, false)
                .await;
            return Ok(());
        };
        if !settings.enabled {
            self.set_state_and_broadcast(
                SupervisorState::Disabled,
                Some(&settings),
                momentum,
                ttc,
                false,
            )
            .await;
            return Ok(());
        }

        let spike_active = match momentum {
            Some(m) => {
                let mut spike = self.spike.lock();
                evaluate_spike(&mut spike, &settings, m, now_ts)
            }
            None => self.spike.lock().active,
        };

        let Some(ttc_value) = ttc else {
            self.set_state_and_broadcast(
                SupervisorState::Inactive,
                Some(&settings),
                momentum,
                None,
                spike_active,
            )
            .await;
            return Ok(());
        };
        let ttc_within = settings.min_time <= ttc_value && ttc_value <= settings.max_time;

        let state = if !ttc_within {
            SupervisorState::Inactive
        } else if spike_active {
            SupervisorState::Paused
        } else {
            SupervisorState::Active
        };
        self.set_state_and_broadcast(state, Some(&settings), momentum, Some(ttc_value), spike_active)
            .await;

        if state != SupervisorState::Active {
            return Ok(());
        }

        let Some(watchlist) = self.state.watchlist() else {
            return Ok(());
        };

        // Each strike key is considered at most once per scan.
        let mut processed: HashSet<(i64, Side)> = HashSet::new();
        for row in &watchlist.strikes {
            let key = (row.strike, row.active_side);
            if !processed.insert(key) {
                continue;
            }
            if let Err(e) = self.consider_strike(row, &settings, now_ts).await {
                warn!(strike = row.strike, error = %e, "strike evaluation failed");
            }
        }
        Ok(())
    }

    async fn consider_strike(
        self: &Arc<Self>,
        row: &StrikeRow,
        settings: &AutoEntrySettings,
        now_ts: i64,
    ) -> Result<()> {
        let key = (row.strike, row.active_side);

        // Atomic cooldown check: reserve the key before any slow work so
        // overlapping scans cannot double-fire.
        if !self.try_reserve_cooldown(key, now_ts) {
            return Ok(());
        }

        if self.is_strike_blocked(row.strike, row.active_side, settings).await? {
            return Ok(());
        }
        if row.probability < settings.min_probability {
            return Ok(());
        }
        let diff = row.active_diff();
        if diff < settings.min_differential - DIFFERENTIAL_LENIENCY {
            debug!(
                strike = row.strike,
                diff, "differential below threshold, skipping"
            );
            return Ok(());
        }

        let request = OpenTradeRequest {
            strike: row.strike as f64,
            side: row.active_side,
            ticker: row.ticker.clone(),
            buy_price: row.active_ask() / 100.0,
            prob: row.probability,
            position: None,
            contract: None,
            symbol: None,
            market: None,
            entry_method: EntryMethod::Auto,
        };

        match self.initiator.open(request).await {
            Ok((trade_id, ticket_id)) => {
                info!(
                    trade_id,
                    ticket_id = %ticket_id,
                    strike = row.strike,
                    side = row.active_side.as_str(),
                    "auto entry emitted"
                );
                self.notifier
                    .notify_automated_trade(serde_json::json!({
                        "strike": row.strike,
                        "side": row.active_side.as_str(),
                        "ticker": row.ticker,
                        "buy_price": row.active_ask() / 100.0,
                        "probability": row.probability,
                        "entry_method": "auto",
                    }))
                    .await;
            }
            Err(e) => {
                // Roll the cooldown back so the next scan may retry.
                warn!(strike = row.strike, error = %e, "auto entry emission failed");
                self.rollback_cooldown(key);
            }
        }
        Ok(())
    }

    /// Compare-and-set cooldown: rejects inside the window, reserves the
    /// slot otherwise.
    fn try_reserve_cooldown(&self, key: (i64, Side), now_ts: i64) -> bool {
        let mut cooldowns = self.cooldowns.lock();
        if let Some(last) = cooldowns.get(&key) {
            if now_ts - last < TRADE_COOLDOWN_SECS {
                return false;
            }
        }
        cooldowns.insert(key, now_ts);
        true
    }

    fn rollback_cooldown(&self, key: (i64, Side)) {
        self.cooldowns.lock().remove(&key);
    }

    fn cleanup_cooldowns(&self, now_ts: i64) {
        self.cooldowns
            .lock()
            .retain(|_, last| now_ts - *last < TRADE_COOLDOWN_SECS);
    }

    /// Duplicate-trade guard. An active (open) or pending trade on the key
    /// always blocks; with re-entry disallowed, a closing trade blocks too
    /// (a fully closed trade never does).
    async fn is_strike_blocked(
        &self,
        strike: i64,
        side: Side,
        settings: &AutoEntrySettings,
    ) -> Result<bool> {
        if self
            .active
            .exists_for_strike_side(strike as f64, side)
            .await?
        {
            return Ok(true);
        }
        let mut blocked_statuses = vec![TradeStatus::Pending];
        if !settings.allow_re_entry {
            blocked_statuses.push(TradeStatus::Closing);
        }
        for status in blocked_statuses {
            let trades = self.ledger.by_status(status).await?;
            if trades
                .iter()
                .any(|t| t.strike == strike as f64 && t.side == side)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn set_state_and_broadcast(
        self: &Arc<Self>,
        state: SupervisorState,
        settings: Option<&AutoEntrySettings>,
        momentum: Option<f64>,
        ttc: Option<i64>,
        spike_active: bool,
    ) {
        let state_changed = {
            let mut current = self.operational.lock();
            let changed = *current != state;
            if changed {
                info!(from = current.as_str(), to = state.as_str(), "auto entry state change");
            }
            *current = state;
            changed
        };
        if state_changed {
            self.bus.publish(BusEvent::SystemHealth {
                component: "auto_entry".to_string(),
                healthy: state != SupervisorState::Disabled,
            });
        }

        let spike = *self.spike.lock();
        let indicator = AutoEntryIndicator {
            enabled: settings.map(|s| s.enabled).unwrap_or(false),
            ttc_within_window: matches!(state, SupervisorState::Active | SupervisorState::Paused),
            scanning_active: state == SupervisorState::Active,
            service_healthy: true,
            spike_alert_active: spike_active,
            spike_alert_momentum_value: spike.momentum_value,
            spike_alert_recovery_countdown: settings.and_then(|s| {
                spike.clock_start.map(|start| {
                    let elapsed = (chrono::Utc::now().timestamp() - start) as f64 / 60.0;
                    (s.spike_alert_cooldown_minutes - elapsed).max(0.0)
                })
            }),
            current_momentum: momentum,
            current_ttc: ttc.unwrap_or(0),
            min_time: settings.map(|s| s.min_time),
            max_time: settings.map(|s| s.max_time),
            last_updated: Some(chrono::Utc::now().to_rfc3339()),
        };

        let changed = {
            let mut last = self.last_indicator.lock();
            let changed = last
                .as_ref()
                .map(|prev| {
                    prev.enabled != indicator.enabled
                        || prev.scanning_active != indicator.scanning_active
                        || prev.ttc_within_window != indicator.ttc_within_window
                        || prev.spike_alert_active != indicator.spike_alert_active
                })
                .unwrap_or(true);
            *last = Some(indicator.clone());
            changed
        };

        if changed {
            if let Ok(doc) = serde_json::to_string(&indicator) {
                self.settings.put_doc("auto_entry_indicator", &doc).await.ok();
            }
            self.bus.publish(BusEvent::IndicatorUpdate { indicator });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AutoEntrySettings {
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

    #[test]
    fn spike_blocks_and_recovers_after_quiet_period() {
        let s = settings();
        let mut spike = SpikeState::default();
        let t0 = 1_000_000;

        // Momentum jumps to +25: paused immediately.
        assert!(evaluate_spike(&mut spike, &s, 25.0, t0));

        // Quiet (<=10) for the next two minutes: still paused until the
        // cooldown elapses.
        assert!(evaluate_spike(&mut spike, &s, 8.0, t0 + 60));
        assert!(evaluate_spike(&mut spike, &s, 9.0, t0 + 119));

        // At exactly two minutes of quiet, scanning resumes.
        assert!(!evaluate_spike(&mut spike, &s, 9.0, t0 + 120));
        assert!(!spike.active);
    }

    #[test]
    fn re_entering_spike_range_resets_recovery_clock() {
        let s = settings();
        let mut spike = SpikeState::default();
        let t0 = 1_000_000;

        assert!(evaluate_spike(&mut spike, &s, 25.0, t0));
        // One minute in, momentum pops to +11 (>= cooldown threshold).
        assert!(evaluate_spike(&mut spike, &s, 11.0, t0 + 60));
        // Two minutes after the original spike: still paused, the clock
        // restarted at t0+60.
        assert!(evaluate_spike(&mut spike, &s, 9.0, t0 + 120));
        // Recovery completes two minutes after the reset.
        assert!(!evaluate_spike(&mut spike, &s, 9.0, t0 + 180));
    }

    #[test]
    fn spike_disabled_never_pauses() {
        let mut s = settings();
        s.spike_alert_enabled = false;
        let mut spike = SpikeState {
            active: true,
            clock_start: Some(5),
            momentum_value: Some(25.0),
        };
        assert!(!evaluate_spike(&mut spike, &s, 99.0, 10));
        assert!(!spike.active);
    }

    fn bare_supervisor() -> Arc<AutoEntrySupervisor> {
        let settings_store = SettingsStore::open_in_memory().unwrap();
        let state = LiveState::new();
        let active = ActiveTradeStore::open_in_memory().unwrap();
        let ledger = TradeLedger::open_in_memory().unwrap();
        let bus = EventBus::new();

        struct NoBroker;
        #[async_trait::async_trait]
        impl crate::broker::BrokerApi for NoBroker {
            async fn get_event(
                &self,
                _: &str,
            ) -> anyhow::Result<crate::broker::types::EventResponse> {
                Err(anyhow::anyhow!("unused"))
            }
            async fn get_balance(&self) -> anyhow::Result<crate::broker::types::BalanceResponse> {
                Err(anyhow::anyhow!("unused"))
            }
            async fn get_positions(
                &self,
                _: Option<&str>,
            ) -> anyhow::Result<crate::broker::types::PositionsResponse> {
                Err(anyhow::anyhow!("unused"))
            }
            async fn get_fills(
                &self,
                _: Option<&str>,
            ) -> anyhow::Result<crate::broker::types::FillsResponse> {
                Err(anyhow::anyhow!("unused"))
            }
            async fn get_orders(
                &self,
                _: Option<&str>,
            ) -> anyhow::Result<crate::broker::types::OrdersResponse> {
                Err(anyhow::anyhow!("unused"))
            }
            async fn get_settlements(
                &self,
                _: Option<&str>,
            ) -> anyhow::Result<crate::broker::types::SettlementsResponse> {
                Err(anyhow::anyhow!("unused"))
            }
            async fn create_order(
                &self,
                _: &crate::broker::types::OrderRequest,
            ) -> anyhow::Result<crate::broker::types::OrderResponse> {
                Err(anyhow::anyhow!("unused"))
            }
        }

        let executor = Arc::new(crate::trade::executor::TradeExecutor::new(Arc::new(NoBroker)));
        let manager = crate::trade::manager::TradeManager::new(
            ledger.clone(),
            crate::store::account::AccountStore::open_in_memory().unwrap(),
            executor,
            bus.clone(),
            Notifier::disabled(),
            state.clone(),
        );
        let initiator = TradeInitiator::new(
            manager,
            state.clone(),
            settings_store.clone(),
            "BTC".into(),
            "Kalshi".into(),
        );
        AutoEntrySupervisor::new(
            settings_store,
            state,
            active,
            ledger,
            initiator,
            bus,
            Notifier::disabled(),
        )
    }

    #[tokio::test]
    async fn cooldown_is_compare_and_set() {
        let supervisor = bare_supervisor();
        let key = (119_000, Side::Yes);
        let t = 1_000;

        assert!(supervisor.try_reserve_cooldown(key, t));
        // Second attempt inside the window loses the race.
        assert!(!supervisor.try_reserve_cooldown(key, t + 5));
        // After the window, the key frees up.
        assert!(supervisor.try_reserve_cooldown(key, t + TRADE_COOLDOWN_SECS));

        // Rollback makes the key immediately available again.
        supervisor.rollback_cooldown(key);
        assert!(supervisor.try_reserve_cooldown(key, t + TRADE_COOLDOWN_SECS + 1));
    }

    #[tokio::test]
    async fn missing_settings_disable_scanning() {
        let supervisor = bare_supervisor();
        supervisor.scan().await.unwrap();
        assert_eq!(supervisor.operational_state(), SupervisorState::Disabled);
    }

    #[tokio::test]
    async fn ttc_outside_window_is_inactive() {
        let supervisor = bare_supervisor();
        supervisor
            .settings
            .set_auto_entry_settings(&settings())
            .await
            .unwrap();
        supervisor.state.set_momentum(5.0);

        // Snapshot with expiry an hour out: ttc ~3600 > max_time 1800.
        let snapshot = crate::models::MarketSnapshot {
            event_ticker: "KXBTCD-26JAN1715".into(),
            event_title: String::new(),
            strike_date: chrono::Utc::now() + chrono::Duration::seconds(3600),
            market_status: "active".into(),
            strike_tier: 250,
            markets: vec![],
            fetched_at: 0,
        };
        supervisor.state.set_snapshot(snapshot);

        supervisor.scan().await.unwrap();
        assert_eq!(supervisor.operational_state(), SupervisorState::Inactive);
    }
}
