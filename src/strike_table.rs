//! Strike-table and watchlist generator.
//!
//! Once per second, joins the latest price, momentum, and market snapshot
//! with the probability surface into a ranked table of candidate strikes.
//! Every artifact write for a cycle reflects one consistent
//! `(price, snapshot, momentum)` triple; files are written atomically so
//! readers never see a torn document.

use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::artifacts::write_json_atomic;
use crate::bus::EventBus;
use crate::models::{
    BusEvent, LiveProbabilitiesDoc, LiveProbability, MarketSnapshot, Side, StrikeRow,
    StrikeTableDoc,
};
use crate::prob::{Direction, ProbabilityTable};
use crate::state::LiveState;
use crate::store::settings::SettingsStore;

/// Strikes considered either side of the money line.
const NUM_LEVELS: i64 = 10;

// Watchlist admission bounds.
const WATCHLIST_MIN_VOLUME: i64 = 1000;
const WATCHLIST_MIN_PROB: f64 = 90.0;
const WATCHLIST_MAX_ASK: f64 = 98.0;
const WATCHLIST_MIN_ACTIVE_DIFF: f64 = -2.0;

const BROKER_NAME: &str = "Kalshi";

/// Candidate strikes around the money line, restricted to those actually
/// quoted in the snapshot.
pub fn candidate_strikes(price: f64, snapshot: &MarketSnapshot) -> Vec<i64> {
    let tier = snapshot.strike_tier;
    if tier <= 0 {
        return Vec::new();
    }
    let base = (price / tier as f64).round() as i64 * tier;
    (-NUM_LEVELS..=NUM_LEVELS)
        .map(|k| base + k * tier)
        .filter(|strike| snapshot.market_for_strike(*strike).is_some())
        .collect()
}

/// Build one cycle's strike rows from a consistent input triple.
pub async fn build_rows(
    price: f64,
    momentum: f64,
    ttc_seconds: i64,
    snapshot: &MarketSnapshot,
    prob_table: &ProbabilityTable,
) -> Result<Vec<StrikeRow>> {
    let mut rows = Vec::new();
    for strike in candidate_strikes(price, snapshot) {
        let Some(market) = snapshot.market_for_strike(strike) else {
            continue;
        };
        let Some(prob) = prob_table
            .prob_for_strike(strike as f64, price, ttc_seconds as f64, momentum)
            .await?
        else {
            debug!(strike, "no probability for strike, skipping");
            continue;
        };

        let buffer = (price - strike as f64).abs();
        let buffer_pct = buffer / snapshot.strike_tier as f64;
        let yes_ask = market.yes_ask as f64;
        let no_ask = market.no_ask as f64;

        // Differentials depend on which side of the money line the strike
        // sits: `prob` always describes the favored side.
        let (yes_diff, no_diff, active_side) = if (strike as f64) < price {
            (prob - yes_ask, (100.0 - prob) - no_ask, Side::Yes)
        } else {
            ((100.0 - prob) - yes_ask, prob - no_ask, Side::No)
        };

        rows.push(StrikeRow {
            strike,
            buffer: round2(buffer),
            buffer_pct: round2(buffer_pct),
            probability: round2(prob),
            yes_ask,
            no_ask,
            yes_diff: round2(yes_diff),
            no_diff: round2(no_diff),
            volume: market.volume,
            ticker: market.ticker.clone(),
            active_side,
        });
    }
    Ok(rows)
}

/// Watchlist filter over a strike table, ranked by probability descending.
pub fn watchlist_rows(rows: &[StrikeRow]) -> Vec<StrikeRow> {
    let mut picked: Vec<StrikeRow> = rows
        .iter()
        .filter(|row| {
            row.volume >= WATCHLIST_MIN_VOLUME
                && row.probability > WATCHLIST_MIN_PROB
                && row.yes_ask.max(row.no_ask) <= WATCHLIST_MAX_ASK
                && row.active_diff() >= WATCHLIST_MIN_ACTIVE_DIFF
        })
        .cloned()
        .collect();
    picked.sort_by(|a, b| {
        b.probability
            .partial_cmp(&a.probability)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    picked
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub struct StrikeTableGenerator {
    symbol: String,
    state: LiveState,
    prob_table: ProbabilityTable,
    settings: SettingsStore,
    bus: EventBus,
    table_path: PathBuf,
    watchlist_path: PathBuf,
    probabilities_path: PathBuf,
}

impl StrikeTableGenerator {
    pub fn new(
        symbol: String,
        state: LiveState,
        prob_table: ProbabilityTable,
        settings: SettingsStore,
        bus: EventBus,
        strike_table_dir: PathBuf,
        probabilities_dir: PathBuf,
    ) -> Self {
        let sym = symbol.to_lowercase();
        Self {
            table_path: strike_table_dir.join(format!("{sym}_strike_table.json")),
            watchlist_path: strike_table_dir.join(format!("{sym}_watchlist.json")),
            probabilities_path: probabilities_dir.join(format!("{sym}_live_probabilities.json")),
            symbol,
            state,
            prob_table,
            settings,
            bus,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                if let Err(e) = self.cycle().await {
                    warn!(error = %e, "strike table cycle failed");
                }
            }
        })
    }

    async fn cycle(&self) -> Result<()> {
        // Capture one consistent input triple up front.
        let (Some(point), Some(snapshot)) = (self.state.price(), self.state.snapshot()) else {
            return Ok(());
        };
        let momentum = self.state.momentum().unwrap_or(0.0);
        let now = Utc::now();
        let ttc = snapshot.ttc_seconds(now);

        let rows = build_rows(point.price, momentum, ttc, &snapshot, &self.prob_table).await?;
        if rows.is_empty() {
            return Ok(());
        }

        let last_updated = now.to_rfc3339();
        let table = StrikeTableDoc {
            symbol: self.symbol.clone(),
            current_price: point.price,
            ttc,
            broker: BROKER_NAME.to_string(),
            event_ticker: snapshot.event_ticker.clone(),
            market_title: snapshot.event_title.clone(),
            strike_tier: snapshot.strike_tier,
            market_status: snapshot.market_status.clone(),
            last_updated: last_updated.clone(),
            strikes: rows.clone(),
        };
        let watchlist = StrikeTableDoc {
            strikes: watchlist_rows(&rows),
            ..table.clone()
        };
        let probabilities = LiveProbabilitiesDoc {
            timestamp: last_updated,
            current_price: point.price,
            ttc_seconds: ttc,
            probabilities: rows
                .iter()
                .map(|row| LiveProbability {
                    strike: row.strike,
                    prob_within: row.probability,
                    direction: Direction::for_strike(row.strike as f64, point.price)
                        .as_str()
                        .to_string(),
                })
                .collect(),
        };

        write_json_atomic(&self.table_path, &table)?;
        write_json_atomic(&self.watchlist_path, &watchlist)?;
        write_json_atomic(&self.probabilities_path, &probabilities)?;

        if let Ok(doc) = serde_json::to_string(&table) {
            self.settings.put_doc("strike_table", &doc).await.ok();
        }
        if let Ok(doc) = serde_json::to_string(&watchlist) {
            self.settings.put_doc("watchlist", &doc).await.ok();
        }

        self.state.set_strike_table(table);
        self.state.set_watchlist(watchlist);
        self.state.heartbeat("strike_table");
        self.bus.publish(BusEvent::MarketUpdate {
            event_ticker: snapshot.event_ticker.clone(),
            ts: now.timestamp(),
        });
        Ok(())
    }
}
