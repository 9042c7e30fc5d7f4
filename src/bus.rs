//! Event bus: one logical bus, two transports.
//!
//! In-process subscribers get typed events over a broadcast channel with
//! best-effort delivery (laggards drop, they do not queue). Cross-process
//! peers get compact HTTP notifications with short timeouts; a failed POST
//! is logged and dropped, never retried inline.

use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::models::BusEvent;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish to all in-process subscribers. Never blocks; an event with no
    /// receivers is simply dropped.
    pub fn publish(&self, event: BusEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("bus event had no receivers: {e}");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<BusEvent> {
        self.tx.clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP fan-out half of the bus. Peers are base URLs (UI processes, split
/// deployments); an empty peer list makes every call a no-op.
#[derive(Clone)]
pub struct Notifier {
    client: Client,
    peers: Vec<String>,
}

impl Notifier {
    pub fn new(peers: Vec<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, peers }
    }

    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    async fn post_all(&self, path: &str, body: serde_json::Value) {
        for peer in &self.peers {
            let url = format!("{peer}{path}");
            match self
                .client
                .post(&url)
                .timeout(Duration::from_secs(2))
                .json(&body)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!(url = %url, status = %resp.status(), "notification rejected"),
                Err(e) => warn!(url = %url, error = %e, "notification failed"),
            }
        }
    }

    /// Mirror-table change notification (`positions`, `fills`, `orders`,
    /// `settlements`, `balance`).
    pub async fn notify_db_change(&self, db_name: &str, change_data: serde_json::Value) {
        self.post_all(
            "/api/notify_db_change",
            json!({
                "db_name": db_name,
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "change_data": change_data,
            }),
        )
        .await;
    }

    /// Trade lifecycle notification toward monitoring UIs.
    pub async fn notify_trade_change(&self, trade_id: i64, ticket_id: &str, status: &str) {
        self.post_all(
            "/api/trade_manager_notification",
            json!({
                "trade_id": trade_id,
                "ticket_id": ticket_id,
                "status": status,
            }),
        )
        .await;
    }

    /// Audio/popup alert for an automated entry.
    pub async fn notify_automated_trade(&self, payload: serde_json::Value) {
        self.post_all("/api/notify_automated_trade", payload).await;
    }
}
