//! Persisted operator settings plus small JSON documents (latest snapshot,
//! strike table, watchlist) readable by the API layer.
//!
//! Required settings that are absent or malformed read back as `None`; the
//! consuming component is expected to report `DISABLED` rather than invent
//! defaults.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::{AutoEntrySettings, TradePreferences};

const AUTO_ENTRY_KEY: &str = "auto_entry_settings";
const TRADE_PREFS_KEY: &str = "trade_preferences";

#[derive(Clone)]
pub struct SettingsStore {
    conn: Arc<Mutex<Connection>>,
}

impl SettingsStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = super::open_connection(db_path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory settings store")?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS json_docs (
                name TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                doc TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, json, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!(key, error = %e, "settings value failed to deserialize");
                Ok(None)
            }
        }
    }

    /// Auto-entry settings; `None` when missing or incomplete.
    pub async fn auto_entry_settings(&self) -> Result<Option<AutoEntrySettings>> {
        self.get(AUTO_ENTRY_KEY).await
    }

    pub async fn set_auto_entry_settings(&self, settings: &AutoEntrySettings) -> Result<()> {
        self.set(AUTO_ENTRY_KEY, settings).await
    }

    pub async fn trade_preferences(&self) -> Result<Option<TradePreferences>> {
        self.get(TRADE_PREFS_KEY).await
    }

    pub async fn set_trade_preferences(&self, prefs: &TradePreferences) -> Result<()> {
        self.set(TRADE_PREFS_KEY, prefs).await
    }

    /// Store a named JSON artifact (latest snapshot, strike table, …).
    pub async fn put_doc(&self, name: &str, doc: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO json_docs (name, ts, doc) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET ts = excluded.ts, doc = excluded.doc",
            params![name, chrono::Utc::now().timestamp(), doc],
        )?;
        Ok(())
    }

    pub async fn get_doc(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let doc = conn
            .query_row(
                "SELECT doc FROM json_docs WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settings_round_trip() {
        let store = SettingsStore::open_in_memory().unwrap();
        let settings = AutoEntrySettings {
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
        };
        store.set_auto_entry_settings(&settings).await.unwrap();
        assert_eq!(store.auto_entry_settings().await.unwrap(), Some(settings));
    }

    #[tokio::test]
    async fn missing_or_malformed_settings_read_back_as_none() {
        let store = SettingsStore::open_in_memory().unwrap();
        assert!(store.auto_entry_settings().await.unwrap().is_none());

        // A partial document must not deserialize into required settings.
        store
            .set("auto_entry_settings", &serde_json::json!({"enabled": true}))
            .await
            .unwrap();
        assert!(store.auto_entry_settings().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_docs_overwrite_by_name() {
        let store = SettingsStore::open_in_memory().unwrap();
        store.put_doc("watchlist", "{\"a\":1}").await.unwrap();
        store.put_doc("watchlist", "{\"a\":2}").await.unwrap();
        assert_eq!(
            store.get_doc("watchlist").await.unwrap().as_deref(),
            Some("{\"a\":2}")
        );
    }
}
