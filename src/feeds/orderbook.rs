//! Authenticated orderbook delta consumer.
//!
//! Maintains an in-memory book per near-the-money contract from the
//! `orderbook_delta` channel and derives top-of-book quotes. The contract
//! list is recomputed from the live price on every reconnect and on a
//! five-minute timer; a derived snapshot is persisted every 100 updates
//! and on disconnect.

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::HeaderName;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::artifacts::write_json_atomic;
use crate::broker::sign::RequestSigner;
use crate::broker::types::{
    OrderbookDeltaMsg, OrderbookSnapshotMsg, WsEnvelope, WsSubscribeCmd, WsSubscribeParams,
};
use crate::models::MarketSnapshot;
use crate::state::{BookTop, LiveState};

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const RESUBSCRIBE_EVERY: Duration = Duration::from_secs(300);
const SNAPSHOT_EVERY_UPDATES: u64 = 100;
/// Contracts this far from the money (symbol units) are not watched.
const NEAR_MONEY_RANGE: f64 = 1000.0;
const NEAR_MONEY_COUNT: usize = 5;

#[derive(Debug, Default, Clone)]
struct ContractBook {
    /// price_cents -> resting quantity, per side.
    yes: BTreeMap<i64, i64>,
    no: BTreeMap<i64, i64>,
    last_update_ts: i64,
}

impl ContractBook {
    fn apply_delta(&mut self, side: &str, price: i64, delta: i64, ts: i64) {
        let book = match side {
            "yes" | "YES" | "Yes" => &mut self.yes,
            _ => &mut self.no,
        };
        let qty = book.entry(price).or_insert(0);
        *qty += delta;
        if *qty <= 0 {
            book.remove(&price);
        }
        self.last_update_ts = ts;
    }

    fn replace(&mut self, yes: &[[i64; 2]], no: &[[i64; 2]], ts: i64) {
        self.yes = yes
            .iter()
            .filter(|lvl| lvl[1] > 0)
            .map(|lvl| (lvl[0], lvl[1]))
            .collect();
        self.no = no
            .iter()
            .filter(|lvl| lvl[1] > 0)
            .map(|lvl| (lvl[0], lvl[1]))
            .collect();
        self.last_update_ts = ts;
    }

    /// Derive the top of book. Asks come from the complement side: buying
    /// yes at price p consumes no liquidity at 100 - p.
    fn top(&self, ticker: &str) -> BookTop {
        let yes_bid = self.yes.keys().next_back().copied();
        let no_bid = self.no.keys().next_back().copied();
        let volume: i64 = self.yes.values().sum::<i64>() + self.no.values().sum::<i64>();
        BookTop {
            ticker: ticker.to_string(),
            yes_bid,
            yes_ask: no_bid.map(|p| 100 - p),
            no_bid,
            no_ask: yes_bid.map(|p| 100 - p),
            volume,
            last_update_ts: self.last_update_ts,
        }
    }
}

/// Pick the contracts worth subscribing to: within range of the money,
/// nearest first, at most `NEAR_MONEY_COUNT`.
pub fn near_money_tickers(snapshot: &MarketSnapshot, price: f64) -> Vec<String> {
    let mut candidates: Vec<(f64, &str)> = snapshot
        .markets
        .iter()
        .filter_map(|m| {
            let distance = (m.floor_strike - price).abs();
            (distance <= NEAR_MONEY_RANGE).then_some((distance, m.ticker.as_str()))
        })
        .collect();
    candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    candidates
        .into_iter()
        .take(NEAR_MONEY_COUNT)
        .map(|(_, t)| t.to_string())
        .collect()
}

pub struct OrderbookConsumer {
    ws_url: String,
    signer: RequestSigner,
    state: LiveState,
    artifact_path: PathBuf,
    books: HashMap<String, ContractBook>,
    update_count: u64,
    next_cmd_id: i64,
}

impl OrderbookConsumer {
    pub fn new(
        ws_url: String,
        signer: RequestSigner,
        state: LiveState,
        artifact_dir: PathBuf,
    ) -> Self {
        Self {
            ws_url,
            signer,
            state,
            artifact_path: artifact_dir.join("orderbook_snapshot.json"),
            books: HashMap::new(),
            update_count: 0,
            next_cmd_id: 1,
        }
    }

    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.session().await {
                    Ok(()) => info!("orderbook session ended, reconnecting"),
                    Err(e) => warn!(error = %e, "orderbook session error"),
                }
                self.write_snapshot();
                sleep(RECONNECT_BACKOFF).await;
            }
        })
    }

    /// One connect-subscribe-stream cycle. Ends on the resubscribe timer so
    /// the contract list follows the money.
    async fn session(&mut self) -> Result<()> {
        let (snapshot, price) = match (self.state.snapshot(), self.state.price()) {
            (Some(s), Some(p)) => (s, p.price),
            _ => {
                debug!("orderbook waiting for snapshot and price");
                sleep(Duration::from_secs(2)).await;
                return Ok(());
            }
        };
        let tickers = near_money_tickers(&snapshot, price);
        if tickers.is_empty() {
            sleep(Duration::from_secs(2)).await;
            return Ok(());
        }

        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .context("build orderbook ws request")?;
        for (name, value) in self.signer.auth_headers("GET", "/trade-api/ws/v2") {
            request.headers_mut().insert(
                HeaderName::from_bytes(name.as_bytes()).context("auth header name")?,
                value.parse().context("auth header value")?,
            );
        }

        let (ws, _) = connect_async(request)
            .await
            .context("connect orderbook websocket")?;
        let (mut write, mut read) = ws.split();

        let cmd = WsSubscribeCmd {
            id: self.next_cmd_id,
            cmd: "subscribe",
            params: WsSubscribeParams {
                channels: vec!["orderbook_delta".to_string()],
                market_tickers: Some(tickers.clone()),
            },
        };
        self.next_cmd_id += 1;
        write
            .send(Message::Text(serde_json::to_string(&cmd)?))
            .await
            .context("send orderbook subscription")?;
        info!(contracts = tickers.len(), "orderbook subscribed");

        // Drop books for contracts no longer watched.
        self.books.retain(|ticker, _| tickers.contains(ticker));

        let mut resubscribe = interval(RESUBSCRIBE_EVERY);
        resubscribe.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = resubscribe.tick() => {
                    debug!("orderbook resubscribe timer fired");
                    return Ok(());
                }
                frame = timeout(READ_TIMEOUT, read.next()) => {
                    let frame = match frame {
                        Ok(Some(Ok(frame))) => frame,
                        Ok(Some(Err(e))) => return Err(e).context("orderbook read"),
                        Ok(None) => return Ok(()),
                        Err(_) => return Err(anyhow!("orderbook read timed out")),
                    };
                    match frame {
                        Message::Text(text) => self.handle_frame(&text),
                        Message::Ping(payload) => {
                            write.send(Message::Pong(payload)).await.ok();
                        }
                        Message::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let Ok(envelope) = serde_json::from_str::<WsEnvelope>(text) else {
            return;
        };
        let now = chrono::Utc::now().timestamp();
        match envelope.msg_type.as_str() {
            "subscribed" => debug!("orderbook subscription acked"),
            "orderbook_snapshot" => {
                let Some(msg) = envelope
                    .msg
                    .and_then(|m| serde_json::from_value::<OrderbookSnapshotMsg>(m).ok())
                else {
                    return;
                };
                self.books
                    .entry(msg.market_ticker.clone())
                    .or_default()
                    .replace(&msg.yes, &msg.no, now);
                self.after_update(&msg.market_ticker);
            }
            "orderbook_delta" => {
                let Some(msg) = envelope
                    .msg
                    .and_then(|m| serde_json::from_value::<OrderbookDeltaMsg>(m).ok())
                else {
                    return;
                };
                self.books
                    .entry(msg.market_ticker.clone())
                    .or_default()
                    .apply_delta(&msg.side, msg.price, msg.delta, now);
                self.after_update(&msg.market_ticker);
            }
            _ => {}
        }
    }

    fn after_update(&mut self, ticker: &str) {
        if let Some(book) = self.books.get(ticker) {
            self.state.set_book_top(book.top(ticker));
        }
        self.state.heartbeat("orderbook");
        self.update_count += 1;
        if self.update_count % SNAPSHOT_EVERY_UPDATES == 0 {
            self.write_snapshot();
        }
    }

    fn write_snapshot(&self) {
        let tops: Vec<BookTop> = self
            .books
            .iter()
            .map(|(ticker, book)| book.top(ticker))
            .collect();
        let doc = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "contracts": tops,
        });
        if let Err(e) = write_json_atomic(&self.artifact_path, &doc) {
            warn!(error = %e, "orderbook snapshot write failed");
        }
    }
}
