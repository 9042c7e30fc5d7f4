//! Process configuration: environment + persisted settings.
//!
//! Env vars carry deployment wiring (paths, ports, credentials); operator
//! settings (auto-entry thresholds, trade preferences) live in the settings
//! store so the UI can edit them at runtime. Required settings that are
//! missing disable the affected component rather than silently defaulting.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Broker account mode. Selects API base URL and credential set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountMode {
    Demo,
    Prod,
}

impl AccountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountMode::Demo => "demo",
            AccountMode::Prod => "prod",
        }
    }

    pub fn parse(s: &str) -> Option<AccountMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "demo" => Some(AccountMode::Demo),
            "prod" => Some(AccountMode::Prod),
            _ => None,
        }
    }

    pub fn api_base(&self) -> &'static str {
        match self {
            AccountMode::Prod => "https://api.elections.kalshi.com/trade-api/v2",
            AccountMode::Demo => "https://demo-api.kalshi.co/trade-api/v2",
        }
    }

    pub fn ws_url(&self) -> &'static str {
        match self {
            AccountMode::Prod => "wss://api.elections.kalshi.com/trade-api/ws/v2",
            AccountMode::Demo => "wss://demo-api.kalshi.co/trade-api/ws/v2",
        }
    }
}

/// Application configuration loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    /// Root for JSON artifacts (strike_tables/, active_trades/, …).
    pub data_dir: PathBuf,
    pub port: u16,
    pub symbol: String,
    /// Product id on the public ticker feed (e.g. "BTC-USD").
    pub product_id: String,
    pub ticker_ws_url: String,
    pub account_mode: AccountMode,
    /// Pre-generated probability lookup database.
    pub prob_table_path: String,
    pub broker_key_id: Option<String>,
    pub broker_key_path: Option<PathBuf>,
    /// Peer base URLs that receive HTTP change notifications (UI, split
    /// deployments). Empty means in-process delivery only.
    pub notify_peers: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./strikebot.db".to_string());

        let data_dir: PathBuf = std::env::var("DATA_DIR")
            .unwrap_or_else(|_| "./data".to_string())
            .into();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8090".to_string())
            .parse()
            .unwrap_or(8090);

        let symbol = std::env::var("SYMBOL").unwrap_or_else(|_| "BTC".to_string());

        let product_id = std::env::var("PRODUCT_ID").unwrap_or_else(|_| "BTC-USD".to_string());

        let ticker_ws_url = std::env::var("TICKER_WS_URL")
            .unwrap_or_else(|_| "wss://ws-feed.exchange.coinbase.com".to_string());

        let account_mode = std::env::var("ACCOUNT_MODE")
            .ok()
            .and_then(|v| AccountMode::parse(&v))
            .unwrap_or(AccountMode::Demo);

        let prob_table_path = std::env::var("PROB_TABLE_PATH")
            .unwrap_or_else(|_| "./data/prob_lookup.db".to_string());

        let broker_key_id = std::env::var("BROKER_API_KEY_ID").ok().filter(|s| !s.is_empty());

        let broker_key_path = std::env::var("BROKER_PRIVATE_KEY_PATH")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let notify_peers = std::env::var("NOTIFY_PEERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_path,
            data_dir,
            port,
            symbol,
            product_id,
            ticker_ws_url,
            account_mode,
            prob_table_path,
            broker_key_id,
            broker_key_path,
            notify_peers,
        })
    }

    pub fn artifact_dir(&self, sub: &str) -> Result<PathBuf> {
        let dir = self.data_dir.join(sub);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create artifact dir {}", dir.display()))?;
        Ok(dir)
    }
}

/// Auto-entry settings. Every field is required; a missing field means the
/// supervisor reports `DISABLED` and emits nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoEntrySettings {
    pub enabled: bool,
    pub min_probability: f64,
    pub min_differential: f64,
    /// TTC window bounds, seconds.
    pub min_time: i64,
    pub max_time: i64,
    pub allow_re_entry: bool,
    pub spike_alert_enabled: bool,
    pub spike_alert_momentum_threshold: f64,
    pub spike_alert_cooldown_threshold: f64,
    pub spike_alert_cooldown_minutes: f64,
}

/// Position sizing preferences. Effective size is `position_size * multiplier`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePreferences {
    pub position_size: i64,
    pub multiplier: i64,
    #[serde(default = "default_trade_strategy")]
    pub trade_strategy: String,
    /// Auto-stop threshold on live PnL, decimal units. `None` disables.
    #[serde(default)]
    pub auto_stop_threshold: Option<f64>,
}

fn default_trade_strategy() -> String {
    "Hourly HTC".to_string()
}

impl TradePreferences {
    pub fn effective_position(&self) -> i64 {
        (self.position_size * self.multiplier).max(1)
    }
}
