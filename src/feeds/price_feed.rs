//! Symbol price feed (public ticker WebSocket).
//!
//! One long-lived subscription per symbol, rate-limited to one retained
//! tick per wall-clock second. Every retained tick lands in the rolling
//! tick log together with the 1-minute average and the weighted momentum
//! features, then fans out as a `PriceUpdate` bus event.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::models::{BusEvent, PricePoint};
use crate::state::LiveState;
use crate::store::ticks::{TickRow, TickStore};

/// Delta horizons (seconds) and their momentum weights.
const MOMENTUM_WEIGHTS: [(i64, f64); 6] = [
    (60, 0.30),
    (120, 0.25),
    (180, 0.20),
    (240, 0.15),
    (900, 0.05),
    (1800, 0.05),
];

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TickerMsg {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    price: Option<String>,
}

pub struct PriceFeed {
    ws_url: String,
    product_id: String,
    symbol: String,
    ticks: TickStore,
    state: LiveState,
    bus: EventBus,
}

impl PriceFeed {
    pub fn new(
        ws_url: String,
        product_id: String,
        symbol: String,
        ticks: TickStore,
        state: LiveState,
        bus: EventBus,
    ) -> Self {
        Self {
            ws_url,
            product_id,
            symbol,
            ticks,
            state,
            bus,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        loop {
            match self.connect_and_stream().await {
                Ok(()) => info!(symbol = %self.symbol, "ticker stream closed"),
                Err(e) => warn!(symbol = %self.symbol, error = %e, "ticker stream error"),
            }
            // Ticks missed while down are skipped, never replayed.
            sleep(RECONNECT_BACKOFF).await;
        }
    }

    async fn connect_and_stream(&self) -> Result<()> {
        let (ws, _) = connect_async(&self.ws_url)
            .await
            .context("connect ticker websocket")?;
        let (mut write, mut read) = ws.split();

        let subscribe = json!({
            "type": "subscribe",
            "channels": [{"name": "ticker", "product_ids": [self.product_id]}],
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("send ticker subscription")?;
        info!(symbol = %self.symbol, product = %self.product_id, "ticker subscribed");

        let mut last_written_second: i64 = 0;
        loop {
            let frame = match timeout(READ_TIMEOUT, read.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => return Err(e).context("ticker read"),
                Ok(None) => return Ok(()),
                Err(_) => {
                    return Err(anyhow::anyhow!("ticker read timed out"));
                }
            };

            match frame {
                Message::Text(text) => {
                    let Ok(msg) = serde_json::from_str::<TickerMsg>(&text) else {
                        continue;
                    };
                    if msg.msg_type != "ticker" {
                        continue;
                    }
                    if msg.product_id.as_deref() != Some(self.product_id.as_str()) {
                        continue;
                    }
                    let Some(price) = msg.price.as_deref().and_then(|p| p.parse::<f64>().ok())
                    else {
                        continue;
                    };
                    if !price.is_finite() || price <= 0.0 {
                        continue;
                    }

                    let ts = chrono::Utc::now().timestamp();
                    self.state.set_price(PricePoint { ts, price });

                    // One retained tick per wall-clock second.
                    if ts == last_written_second {
                        continue;
                    }
                    last_written_second = ts;

                    if let Err(e) = self.record_tick(ts, price).await {
                        warn!(error = %e, "tick write failed");
                        continue;
                    }
                    self.bus.publish(BusEvent::PriceUpdate {
                        symbol: self.symbol.clone(),
                        price,
                        ts,
                    });
                }
                Message::Ping(payload) => {
                    write.send(Message::Pong(payload)).await.ok();
                }
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }
    }

    async fn record_tick(&self, ts: i64, price: f64) -> Result<()> {
        let one_minute_avg = self.ticks.avg_price_since(ts - 60).await?;

        let mut deltas: [Option<f64>; 6] = [None; 6];
        for (i, (horizon, _)) in MOMENTUM_WEIGHTS.iter().enumerate() {
            if let Some((_, past)) = self.ticks.price_at_or_before(ts - horizon).await? {
                deltas[i] = delta_pct(price, past);
            }
        }

        let momentum_score = weighted_momentum(&deltas);
        let momentum = momentum_score.map(|m| (m * 100.0).round() as i64);
        if let Some(m) = momentum {
            self.state.set_momentum(m as f64);
        }

        self.ticks
            .insert_tick(&TickRow {
                ts,
                price,
                one_minute_avg,
                momentum,
                delta_1m: deltas[0],
                delta_2m: deltas[1],
                delta_3m: deltas[2],
                delta_4m: deltas[3],
                delta_15m: deltas[4],
                delta_30m: deltas[5],
            })
            .await?;
        self.state.heartbeat("price_feed");
        debug!(ts, price, ?momentum, "tick recorded");
        Ok(())
    }
}

/// Percentage change from `past` to `now`.
fn delta_pct(now: f64, past: f64) -> Option<f64> {
    if past <= 0.0 {
        return None;
    }
    Some((now - past) / past * 100.0)
}

/// Weighted mean of the non-null horizon deltas; `None` when no horizon has
/// data yet.
pub fn weighted_momentum(deltas: &[Option<f64>; 6]) -> Option<f64> {
    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    for ((_, weight), delta) in MOMENTUM_WEIGHTS.iter().zip(deltas.iter()) {
        if let Some(d) = delta {
            sum += weight * d;
            weight_sum += weight;
        }
    }
    if weight_sum > 0.0 {
        Some(sum / weight_sum)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn momentum_is_weight_normalized() {
        // All six horizons present with the same delta: score equals it.
        let deltas = [Some(0.05); 6];
        let m = weighted_momentum(&deltas).unwrap();
        assert!((m - 0.05).abs() < 1e-12);
    }

    #[test]
    fn missing_horizons_renormalize() {
        // Only 1m and 2m available.
        let deltas = [Some(0.10), Some(0.02), None, None, None, None];
        let m = weighted_momentum(&deltas).unwrap();
        let expected = (0.30 * 0.10 + 0.25 * 0.02) / (0.30 + 0.25);
        assert!((m - expected).abs() < 1e-12);
    }

    #[test]
    fn no_history_means_no_momentum() {
        assert_eq!(weighted_momentum(&[None; 6]), None);
    }

    #[test]
    fn delta_pct_guards_division() {
        assert_eq!(delta_pct(100.0, 0.0), None);
        let d = delta_pct(101.0, 100.0).unwrap();
        assert!((d - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn record_tick_scales_momentum_to_integer() {
        let ticks = TickStore::open_in_memory().unwrap();
        let state = LiveState::new();
        let bus = EventBus::new();
        let feed = PriceFeed::new(
            "wss://unused".into(),
            "BTC-USD".into(),
            "BTC".into(),
            ticks.clone(),
            state.clone(),
            bus,
        );

        let base = 1_700_000_000;
        feed.record_tick(base, 100_000.0).await.unwrap();
        // One minute later, up 0.1%.
        feed.record_tick(base + 60, 100_100.0).await.unwrap();

        let latest = ticks.latest().await.unwrap().unwrap();
        assert_eq!(latest.ts, base + 60);
        // Single available horizon (1m) with delta 0.1% -> score 0.1 -> x100.
        assert_eq!(latest.momentum, Some(10));
        assert_eq!(state.momentum(), Some(10.0));
    }
}
