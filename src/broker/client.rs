//! Signed REST client for the broker. Thin: retries and interpretation
//! belong to the calling component.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::broker::sign::RequestSigner;
use crate::broker::types::*;
use crate::config::AccountMode;

/// Broker capability set consumed by the executor, account sync, and the
/// market snapshot worker. Test doubles implement this.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn get_event(&self, event_ticker: &str) -> Result<EventResponse>;
    async fn get_balance(&self) -> Result<BalanceResponse>;
    async fn get_positions(&self, cursor: Option<&str>) -> Result<PositionsResponse>;
    async fn get_fills(&self, cursor: Option<&str>) -> Result<FillsResponse>;
    async fn get_orders(&self, cursor: Option<&str>) -> Result<OrdersResponse>;
    async fn get_settlements(&self, cursor: Option<&str>) -> Result<SettlementsResponse>;
    async fn create_order(&self, order: &OrderRequest) -> Result<OrderResponse>;
}

pub struct KalshiClient {
    client: Client,
    mode: AccountMode,
    signer: RequestSigner,
}

/// Path prefix covered by the request signature.
const SIGN_PREFIX: &str = "/trade-api/v2";

impl KalshiClient {
    pub fn new(mode: AccountMode, signer: RequestSigner) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("strikebot/0.1")
            .build()
            .context("build broker http client")?;
        Ok(Self {
            client,
            mode,
            signer,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.mode.api_base(), path)
    }

    async fn get_signed<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let full_path = format!("{SIGN_PREFIX}{path}");
        let mut req = self.client.get(self.url(path));
        for (name, value) in self.signer.auth_headers("GET", &full_path) {
            req = req.header(name, value);
        }
        let resp = req.send().await.with_context(|| format!("GET {path}"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("broker GET {path} failed: {status} {body}"));
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("decode GET {path}"))
    }

    fn with_cursor(path: &str, cursor: Option<&str>) -> String {
        match cursor {
            Some(c) if !c.is_empty() => format!("{path}?cursor={c}"),
            _ => path.to_string(),
        }
    }
}

#[async_trait]
impl BrokerApi for KalshiClient {
    /// Event lookups are public; no signature required.
    async fn get_event(&self, event_ticker: &str) -> Result<EventResponse> {
        let path = format!("/events/{event_ticker}");
        let resp = self
            .client
            .get(self.url(&path))
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("broker GET {path} failed: {status}"));
        }
        let event: EventResponse = resp.json().await.context("decode event response")?;
        if let Some(err) = &event.error {
            return Err(anyhow!("broker event error for {event_ticker}: {err}"));
        }
        Ok(event)
    }

    async fn get_balance(&self) -> Result<BalanceResponse> {
        self.get_signed("/portfolio/balance").await
    }

    async fn get_positions(&self, cursor: Option<&str>) -> Result<PositionsResponse> {
        self.get_signed(&Self::with_cursor("/portfolio/positions", cursor))
            .await
    }

    async fn get_fills(&self, cursor: Option<&str>) -> Result<FillsResponse> {
        self.get_signed(&Self::with_cursor("/portfolio/fills", cursor))
            .await
    }

    async fn get_orders(&self, cursor: Option<&str>) -> Result<OrdersResponse> {
        self.get_signed(&Self::with_cursor("/portfolio/orders", cursor))
            .await
    }

    async fn get_settlements(&self, cursor: Option<&str>) -> Result<SettlementsResponse> {
        self.get_signed(&Self::with_cursor("/portfolio/settlements", cursor))
            .await
    }

    async fn create_order(&self, order: &OrderRequest) -> Result<OrderResponse> {
        let path = "/portfolio/orders";
        let full_path = format!("{SIGN_PREFIX}{path}");
        let mut req = self
            .client
            .post(self.url(path))
            .timeout(Duration::from_secs(5))
            .json(order);
        for (name, value) in self.signer.auth_headers("POST", &full_path) {
            req = req.header(name, value);
        }
        debug!(ticker = %order.ticker, side = %order.side, count = order.count, "submitting order");
        let resp = req.send().await.context("POST order")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("broker order rejected: {status} {body}"));
        }
        resp.json::<OrderResponse>().await.context("decode order ack")
    }
}
