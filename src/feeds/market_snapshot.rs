//! Hourly event snapshot worker.
//!
//! Resolves the active hourly event ticker from the exchange clock, fetches
//! the event and its strike markets once per second, infers the strike tier
//! and publishes the snapshot. A ticker that just failed is cached so the
//! worker advances to the next hour instead of hammering the broker.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::broker::types::{BrokerMarket, EventResponse};
use crate::broker::BrokerApi;
use crate::bus::EventBus;
use crate::models::{BusEvent, MarketQuote, MarketSnapshot, EXCHANGE_TZ};
use crate::state::LiveState;
use crate::store::settings::SettingsStore;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Event ticker for the hourly contract expiring at the top of the hour
/// after `now` (exchange expiry convention), e.g. `KXBTCD-26JAN1715`.
pub fn event_ticker_for(series: &str, now: DateTime<Tz>) -> String {
    let expiry = now + ChronoDuration::hours(1);
    format!(
        "{series}-{:02}{}{:02}{:02}",
        expiry.year() % 100,
        month_abbr(expiry.month()),
        expiry.day(),
        expiry.hour()
    )
}

fn month_abbr(month: u32) -> &'static str {
    match month {
        1 => "JAN",
        2 => "FEB",
        3 => "MAR",
        4 => "APR",
        5 => "MAY",
        6 => "JUN",
        7 => "JUL",
        8 => "AUG",
        9 => "SEP",
        10 => "OCT",
        11 => "NOV",
        _ => "DEC",
    }
}

/// Observed common difference of the sorted strike ladder.
///
/// The target market's strikes are equally spaced; a violation is external
/// bad data and is reported, never guessed around. The first consecutive
/// difference is still returned so downstream intersection can proceed.
pub fn infer_strike_tier(markets: &[BrokerMarket]) -> Result<i64> {
    let mut strikes: Vec<f64> = markets.iter().filter_map(|m| m.floor_strike).collect();
    if strikes.len() < 2 {
        return Err(anyhow!("insufficient strikes to infer tier"));
    }
    strikes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let tier = (strikes[1] - strikes[0]).round() as i64;
    if tier <= 0 {
        return Err(anyhow!("non-positive strike spacing"));
    }
    for pair in strikes.windows(2) {
        let diff = (pair[1] - pair[0]).round() as i64;
        if diff != tier {
            warn!(
                expected = tier,
                observed = diff,
                "strike ladder is not equally spaced"
            );
        }
    }
    Ok(tier)
}

/// Round a floor strike (quoted one cent below) up to the round strike.
pub fn round_strike(floor_strike: f64) -> i64 {
    (floor_strike + 0.01).round() as i64
}

pub struct MarketSnapshotWorker {
    broker: Arc<dyn BrokerApi>,
    series: String,
    state: LiveState,
    bus: EventBus,
    settings: SettingsStore,
    last_failed_ticker: Option<String>,
}

impl MarketSnapshotWorker {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        series: String,
        state: LiveState,
        bus: EventBus,
        settings: SettingsStore,
    ) -> Self {
        Self {
            broker,
            series,
            state,
            bus,
            settings,
            last_failed_ticker: None,
        }
    }

    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll_once().await {
                    debug!(error = %e, "snapshot poll failed");
                }
            }
        })
    }

    async fn poll_once(&mut self) -> Result<()> {
        let now = Utc::now().with_timezone(&EXCHANGE_TZ);
        let current = event_ticker_for(&self.series, now);

        let resolved = if self.last_failed_ticker.as_deref() != Some(current.as_str()) {
            match self.fetch(&current).await {
                Some(event) => Some((current.clone(), event)),
                None => {
                    self.last_failed_ticker = Some(current.clone());
                    None
                }
            }
        } else {
            None
        };

        // Current hour empty or known-bad: advance one hour.
        let resolved = match resolved {
            Some(r) => Some(r),
            None => {
                let next = event_ticker_for(&self.series, now + ChronoDuration::hours(1));
                self.fetch(&next).await.map(|event| (next, event))
            }
        };

        let Some((event_ticker, event)) = resolved else {
            return Err(anyhow!("no market data for current or next hour ticker"));
        };

        let snapshot = build_snapshot(&event_ticker, &event, Utc::now())?;
        info!(
            event = %event_ticker,
            strikes = snapshot.markets.len(),
            tier = snapshot.strike_tier,
            "market snapshot refreshed"
        );

        // Atomic publish: DB doc + shared state + bus, in that order.
        if let Ok(doc) = serde_json::to_string(&snapshot) {
            self.settings.put_doc("latest_market_snapshot", &doc).await.ok();
        }
        self.state.set_snapshot(snapshot);
        self.state.heartbeat("market_snapshot");
        self.bus.publish(BusEvent::MarketUpdate {
            event_ticker,
            ts: Utc::now().timestamp(),
        });
        Ok(())
    }

    async fn fetch(&self, event_ticker: &str) -> Option<EventResponse> {
        match self.broker.get_event(event_ticker).await {
            Ok(event) if !event.markets.is_empty() => Some(event),
            Ok(_) => {
                debug!(event = event_ticker, "event has no markets yet");
                None
            }
            Err(e) => {
                debug!(event = event_ticker, error = %e, "event fetch failed");
                None
            }
        }
    }
}

/// Normalize a broker event response into the snapshot document.
pub fn build_snapshot(
    event_ticker: &str,
    event: &EventResponse,
    now: DateTime<Utc>,
) -> Result<MarketSnapshot> {
    let strike_tier = infer_strike_tier(&event.markets)?;

    let strike_date = event
        .event
        .as_ref()
        .and_then(|e| e.strike_date.as_deref())
        .or_else(|| event.markets.iter().find_map(|m| m.close_time.as_deref()))
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| {
            // Fall back to the next top of hour.
            let secs = now.timestamp();
            Utc.timestamp_opt(secs - secs.rem_euclid(3600) + 3600, 0)
                .single()
                .unwrap_or(now)
        });

    let event_title = event
        .event
        .as_ref()
        .and_then(|e| e.title.clone())
        .unwrap_or_default();

    let market_status = event
        .markets
        .iter()
        .find_map(|m| m.status.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let markets = event
        .markets
        .iter()
        .filter_map(|m| {
            let floor_strike = m.floor_strike?;
            Some(MarketQuote {
                ticker: m.ticker.clone(),
                floor_strike,
                strike: round_strike(floor_strike),
                yes_bid: m.yes_bid.unwrap_or(0),
                yes_ask: m.yes_ask.unwrap_or(0),
                no_bid: m.no_bid.unwrap_or(0),
                no_ask: m.no_ask.unwrap_or(0),
                last_price: m.last_price.unwrap_or(0),
                volume: m.volume.unwrap_or(0),
                volume_24h: m.volume_24h.unwrap_or(0),
                open_interest: m.open_interest.unwrap_or(0),
            })
        })
        .collect();

    Ok(MarketSnapshot {
        event_ticker: event_ticker.to_string(),
        event_title,
        strike_date,
        market_status,
        strike_tier,
        markets,
        fetched_at: now.timestamp(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn market(floor_strike: f64) -> BrokerMarket {
        BrokerMarket {
            ticker: format!("KXBTCD-26JAN1715-T{}", round_strike(floor_strike)),
            floor_strike: Some(floor_strike),
            yes_bid: Some(90),
            yes_ask: Some(93),
            no_bid: Some(5),
            no_ask: Some(8),
            last_price: Some(92),
            volume: Some(1500),
            volume_24h: Some(9000),
            open_interest: Some(400),
            status: Some("active".into()),
            close_time: Some("2026-01-17T20:00:00Z".into()),
        }
    }

    #[test]
    fn ticker_follows_exchange_expiry_convention() {
        // 14:05 exchange time -> contract expiring 15:00 -> hour 15.
        let now = EXCHANGE_TZ.with_ymd_and_hms(2026, 1, 17, 14, 5, 9).unwrap();
        assert_eq!(event_ticker_for("KXBTCD", now), "KXBTCD-26JAN1715");

        // 23:30 rolls the day.
        let late = EXCHANGE_TZ.with_ymd_and_hms(2026, 1, 17, 23, 30, 0).unwrap();
        assert_eq!(event_ticker_for("KXBTCD", late), "KXBTCD-26JAN1800");
    }

    #[test]
    fn strike_tier_from_equal_spacing() {
        let markets = vec![
            market(118_749.99),
            market(118_999.99),
            market(119_249.99),
            market(119_499.99),
        ];
        assert_eq!(infer_strike_tier(&markets).unwrap(), 250);
    }

    #[test]
    fn strike_tier_with_gap_still_reports_first_diff() {
        let markets = vec![market(118_749.99), market(118_999.99), market(119_499.99)];
        // First consecutive difference wins; the misalignment is logged.
        assert_eq!(infer_strike_tier(&markets).unwrap(), 250);
    }

    #[test]
    fn strike_tier_needs_two_strikes() {
        assert!(infer_strike_tier(&[market(119_000.0)]).is_err());
        assert!(infer_strike_tier(&[]).is_err());
    }

    #[test]
    fn floor_strikes_round_up_to_round_values() {
        assert_eq!(round_strike(118_999.99), 119_000);
        assert_eq!(round_strike(118_749.99), 118_750);
    }

    #[test]
    fn snapshot_carries_tier_and_ttc() {
        let event = EventResponse {
            event: Some(crate::broker::types::EventInfo {
                event_ticker: "KXBTCD-26JAN1715".into(),
                title: Some("BTC price at 3pm EST".into()),
                strike_date: Some("2026-01-17T20:00:00Z".into()),
            }),
            markets: vec![market(118_999.99), market(119_249.99)],
            error: None,
        };
        let now = Utc.with_ymd_and_hms(2026, 1, 17, 19, 50, 0).unwrap();
        let snapshot = build_snapshot("KXBTCD-26JAN1715", &event, now).unwrap();
        assert_eq!(snapshot.strike_tier, 250);
        assert_eq!(snapshot.ttc_seconds(now), 600);
        assert_eq!(snapshot.market_for_strike(119_000).unwrap().yes_ask, 93);
    }
}
