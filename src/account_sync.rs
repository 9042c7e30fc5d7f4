//! Account sync: mirrors broker balance, positions, fills, orders, and
//! settlements into the account store.
//!
//! Hybrid trigger model: a WebSocket subscription to the `market_positions`
//! channel fires a full polling pass the moment anything changes, and a
//! coarse 60 s timer re-polls balance and settlements as a safety net (a
//! missed change notification is always covered by the next timer pass).
//! Every endpoint response is hashed before writing; unchanged payloads are
//! skipped so downstream fan-out only fires on real change.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::HeaderName;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::broker::sign::RequestSigner;
use crate::broker::types::{WsEnvelope, WsSubscribeCmd, WsSubscribeParams};
use crate::broker::BrokerApi;
use crate::bus::{EventBus, Notifier};
use crate::models::BusEvent;
use crate::store::account::{AccountStore, FillRow, OrderRow, PositionRow, SettlementRow};

const SAFETY_POLL: Duration = Duration::from_secs(60);
const WS_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const MAX_PAGES: usize = 20;

pub struct AccountSync {
    broker: Arc<dyn BrokerApi>,
    account: AccountStore,
    bus: EventBus,
    notifier: Notifier,
    ws: Option<(String, RequestSigner)>,
    hashes: SyncMutex<HashMap<&'static str, [u8; 32]>>,
}

impl AccountSync {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        account: AccountStore,
        bus: EventBus,
        notifier: Notifier,
        ws: Option<(String, RequestSigner)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            account,
            bus,
            notifier,
            ws,
            hashes: SyncMutex::new(HashMap::new()),
        })
    }

    /// Initial full sync, then WebSocket-triggered passes plus the safety
    /// timer.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.sync_all().await {
                warn!(error = %e, "initial account sync failed");
            }

            let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(16);

            if let Some((ws_url, signer)) = self.ws.clone() {
                let sync = self.clone();
                let tx = trigger_tx.clone();
                tokio::spawn(async move {
                    sync.ws_trigger_loop(ws_url, signer, tx).await;
                });
            }

            let sync = self.clone();
            tokio::spawn(async move {
                let mut tick = interval(SAFETY_POLL);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if let Err(e) = sync.sync_balance().await {
                        debug!(error = %e, "safety balance poll failed");
                    }
                    if let Err(e) = sync.sync_settlements().await {
                        debug!(error = %e, "safety settlements poll failed");
                    }
                }
            });

            while trigger_rx.recv().await.is_some() {
                // Collapse bursts of triggers into one pass.
                while trigger_rx.try_recv().is_ok() {}
                if let Err(e) = self.sync_all().await {
                    warn!(error = %e, "triggered account sync failed");
                }
            }
        })
    }

    /// One full polling pass over every mirrored endpoint.
    pub async fn sync_all(self: &Arc<Self>) -> Result<()> {
        self.sync_balance().await?;
        self.sync_positions().await?;
        self.sync_fills().await?;
        self.sync_orders().await?;
        self.sync_settlements().await?;
        Ok(())
    }

    /// Hash-gate an endpoint payload; true means the payload changed and
    /// was recorded.
    fn payload_changed<T: serde::Serialize>(&self, endpoint: &'static str, payload: &T) -> bool {
        let canonical = serde_json::to_vec(payload).unwrap_or_default();
        let digest: [u8; 32] = Sha256::digest(&canonical).into();
        let mut hashes = self.hashes.lock();
        if hashes.get(endpoint) == Some(&digest) {
            return false;
        }
        hashes.insert(endpoint, digest);
        true
    }

    async fn fan_out(&self, db_name: &str, change_data: serde_json::Value) {
        self.bus.publish(BusEvent::DbChanged {
            db_name: db_name.to_string(),
        });
        self.notifier.notify_db_change(db_name, change_data).await;
    }

    pub async fn sync_balance(self: &Arc<Self>) -> Result<()> {
        let resp = self.broker.get_balance().await.context("fetch balance")?;
        if !self.payload_changed("balance", &resp) {
            return Ok(());
        }
        let balance = resp.balance as f64 / 100.0;
        self.account
            .upsert_balance(balance, chrono::Utc::now().timestamp())
            .await?;
        self.fan_out("balance", serde_json::json!({ "balance": balance }))
            .await;
        Ok(())
    }

    pub async fn sync_positions(self: &Arc<Self>) -> Result<()> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self
                .broker
                .get_positions(cursor.as_deref())
                .await
                .context("fetch positions")?;
            all.extend(page.market_positions);
            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        if !self.payload_changed("positions", &all) {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        let mut changed_tickers = Vec::new();
        for pos in &all {
            let row = PositionRow {
                ticker: pos.ticker.clone(),
                total_traded: pos.total_traded as f64 / 100.0,
                position: pos.position,
                // Exposure stays in centi-cents, as the broker reports it.
                market_exposure: pos.market_exposure as f64,
                realized_pnl: pos.realized_pnl as f64 / 100.0,
                fees_paid: pos.fees_paid as f64 / 100.0,
                last_updated_ts: now,
                raw: serde_json::to_string(pos).unwrap_or_default(),
            };
            self.account.upsert_position(&row).await?;
            changed_tickers.push(pos.ticker.clone());
            self.bus.publish(BusEvent::PositionUpdate {
                ticker: pos.ticker.clone(),
            });
        }
        info!(count = all.len(), "positions mirror refreshed");
        self.fan_out("positions", serde_json::json!({ "tickers": changed_tickers }))
            .await;
        Ok(())
    }

    pub async fn sync_fills(self: &Arc<Self>) -> Result<()> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self
                .broker
                .get_fills(cursor.as_deref())
                .await
                .context("fetch fills")?;
            all.extend(page.fills);
            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        if !self.payload_changed("fills", &all) {
            return Ok(());
        }

        let mut inserted = 0usize;
        for fill in &all {
            let row = FillRow {
                trade_id: fill.trade_id.clone(),
                ticker: fill.ticker.clone(),
                order_id: fill.order_id.clone(),
                side: fill.side.clone(),
                action: fill.action.clone(),
                count: fill.count,
                yes_price: fill.yes_price as f64 / 100.0,
                no_price: fill.no_price as f64 / 100.0,
                is_taker: fill.is_taker,
                created_time: fill.created_time.clone(),
            };
            if self.account.insert_fill(&row).await? {
                inserted += 1;
            }
        }
        if inserted > 0 {
            info!(inserted, "new fills mirrored");
        }
        self.fan_out("fills", serde_json::json!({ "inserted": inserted }))
            .await;
        Ok(())
    }

    pub async fn sync_orders(self: &Arc<Self>) -> Result<()> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self
                .broker
                .get_orders(cursor.as_deref())
                .await
                .context("fetch orders")?;
            all.extend(page.orders);
            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        if !self.payload_changed("orders", &all) {
            return Ok(());
        }

        let mut inserted = 0usize;
        for order in &all {
            let row = OrderRow {
                order_id: order.order_id.clone(),
                ticker: order.ticker.clone(),
                side: order.side.clone(),
                action: order.action.clone(),
                status: order.status.clone(),
                yes_price: order.yes_price.map(|c| c as f64 / 100.0),
                no_price: order.no_price.map(|c| c as f64 / 100.0),
                count: order.count,
                created_time: order.created_time.clone(),
            };
            if self.account.insert_order(&row).await? {
                inserted += 1;
            }
        }
        self.fan_out("orders", serde_json::json!({ "inserted": inserted }))
            .await;
        Ok(())
    }

    pub async fn sync_settlements(self: &Arc<Self>) -> Result<()> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self
                .broker
                .get_settlements(cursor.as_deref())
                .await
                .context("fetch settlements")?;
            all.extend(page.settlements);
            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        if !self.payload_changed("settlements", &all) {
            return Ok(());
        }

        let mut inserted = 0usize;
        for settlement in &all {
            let row = SettlementRow {
                ticker: settlement.ticker.clone(),
                market_result: settlement.market_result.clone(),
                revenue: settlement.revenue as f64 / 100.0,
                yes_count: settlement.yes_count,
                no_count: settlement.no_count,
                settled_time: settlement.settled_time.clone(),
            };
            if self.account.insert_settlement(&row).await? {
                inserted += 1;
            }
        }
        if inserted > 0 {
            info!(inserted, "new settlements mirrored");
        }
        self.fan_out("settlements", serde_json::json!({ "inserted": inserted }))
            .await;
        Ok(())
    }

    /// Hold a `market_positions` subscription and convert every position
    /// message into a sync trigger.
    async fn ws_trigger_loop(
        self: &Arc<Self>,
        ws_url: String,
        signer: RequestSigner,
        trigger: mpsc::Sender<()>,
    ) {
        loop {
            if let Err(e) = self.ws_session(&ws_url, &signer, &trigger).await {
                warn!(error = %e, "account sync websocket dropped");
            }
            sleep(WS_RECONNECT_BACKOFF).await;
        }
    }

    async fn ws_session(
        &self,
        ws_url: &str,
        signer: &RequestSigner,
        trigger: &mpsc::Sender<()>,
    ) -> Result<()> {
        let mut request = ws_url
            .into_client_request()
            .context("build account sync ws request")?;
        for (name, value) in signer.auth_headers("GET", "/trade-api/ws/v2") {
            request.headers_mut().insert(
                HeaderName::from_bytes(name.as_bytes()).context("auth header name")?,
                value.parse().context("auth header value")?,
            );
        }
        let (ws, _) = connect_async(request)
            .await
            .context("connect account sync websocket")?;
        let (mut write, mut read) = ws.split();

        let cmd = WsSubscribeCmd {
            id: 1,
            cmd: "subscribe",
            params: WsSubscribeParams {
                channels: vec!["market_positions".to_string()],
                market_tickers: None,
            },
        };
        write
            .send(Message::Text(serde_json::to_string(&cmd)?))
            .await
            .context("send account sync subscription")?;
        info!("account sync subscribed to market_positions");

        while let Some(frame) = read.next().await {
            match frame.context("account sync ws read")? {
                Message::Text(text) => {
                    let Ok(envelope) = serde_json::from_str::<WsEnvelope>(&text) else {
                        continue;
                    };
                    match envelope.msg_type.as_str() {
                        "subscribed" => debug!("account sync subscription acked"),
                        "market_position" | "market_positions" => {
                            debug!("position change trigger received");
                            trigger.try_send(()).ok();
                        }
                        _ => {}
                    }
                }
                Message::Ping(payload) => {
                    write.send(Message::Pong(payload)).await.ok();
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::types::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Broker double serving one static snapshot of account state.
    struct StaticBroker {
        position_calls: AtomicUsize,
    }

    #[async_trait]
    impl BrokerApi for StaticBroker {
        async fn get_event(&self, _: &str) -> Result<EventResponse> {
            unreachable!()
        }
        async fn get_balance(&self) -> Result<BalanceResponse> {
            Ok(BalanceResponse { balance: 102_455 })
        }
        async fn get_positions(&self, _: Option<&str>) -> Result<PositionsResponse> {
            self.position_calls.fetch_add(1, Ordering::SeqCst);
            Ok(PositionsResponse {
                market_positions: vec![ApiMarketPosition {
                    ticker: "T-119000".into(),
                    position: 3,
                    total_traded: 279,
                    market_exposure: 27_900,
                    realized_pnl: 0,
                    fees_paid: 20,
                    last_updated_ts: None,
                }],
                cursor: None,
            })
        }
        async fn get_fills(&self, _: Option<&str>) -> Result<FillsResponse> {
            Ok(FillsResponse {
                fills: vec![ApiFill {
                    trade_id: "f-1".into(),
                    ticker: "T-119000".into(),
                    order_id: "o-1".into(),
                    side: "yes".into(),
                    action: "buy".into(),
                    count: 3,
                    yes_price: 93,
                    no_price: 7,
                    is_taker: true,
                    created_time: "2026-01-17T19:05:09Z".into(),
                }],
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
        async fn create_order(&self, _: &OrderRequest) -> Result<OrderResponse> {
            unreachable!()
        }
    }

    fn sync() -> (Arc<AccountSync>, AccountStore, EventBus) {
        let account = AccountStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let sync = AccountSync::new(
            Arc::new(StaticBroker {
                position_calls: AtomicUsize::new(0),
            }),
            account.clone(),
            bus.clone(),
            Notifier::disabled(),
            None,
        );
        (sync, account, bus)
    }

    #[tokio::test]
    async fn monetary_fields_convert_on_ingest() {
        let (sync, account, _bus) = sync();
        sync.sync_all().await.unwrap();

        assert_eq!(account.balance().await.unwrap(), Some(1024.55));

        let pos = account.position("T-119000").await.unwrap().unwrap();
        assert_eq!(pos.position, 3);
        // Exposure mirrored raw (centi-cents); fees converted to decimal.
        assert_eq!(pos.market_exposure, 27_900.0);
        assert_eq!(pos.fees_paid, 0.20);

        let fill = account
            .latest_fill_on_side("T-119000", "yes")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fill.yes_price, 0.93);
        assert_eq!(fill.no_price, 0.07);
    }

    #[tokio::test]
    async fn identical_payloads_are_hash_gated() {
        let (sync, _account, bus) = sync();
        let mut rx = bus.subscribe();

        sync.sync_positions().await.unwrap();
        // Drain the events from the first pass.
        let mut first_pass_events = 0;
        while rx.try_recv().is_ok() {
            first_pass_events += 1;
        }
        assert!(first_pass_events > 0);

        // Second pass over byte-identical payload: no writes, no fan-out.
        sync.sync_positions().await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
