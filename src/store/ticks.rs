//! Rolling symbol tick log: one row per wall-clock second, 30-day window.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Retention window for tick rows, seconds.
const RETENTION_SECS: i64 = 30 * 24 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRow {
    /// Unix seconds, UTC. Unique per symbol log.
    pub ts: i64,
    pub price: f64,
    pub one_minute_avg: Option<f64>,
    /// Weighted momentum score, scaled x100 and stored as integer.
    pub momentum: Option<i64>,
    pub delta_1m: Option<f64>,
    pub delta_2m: Option<f64>,
    pub delta_3m: Option<f64>,
    pub delta_4m: Option<f64>,
    pub delta_15m: Option<f64>,
    pub delta_30m: Option<f64>,
}

#[derive(Clone)]
pub struct TickStore {
    conn: Arc<Mutex<Connection>>,
}

impl TickStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = super::open_connection(db_path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory tick store")?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS price_log (
                ts INTEGER PRIMARY KEY,
                price REAL NOT NULL,
                one_minute_avg REAL,
                momentum INTEGER,
                delta_1m REAL,
                delta_2m REAL,
                delta_3m REAL,
                delta_4m REAL,
                delta_15m REAL,
                delta_30m REAL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_price_log_ts ON price_log(ts DESC)",
            [],
        )?;
        Ok(())
    }

    /// Upsert a tick row (duplicate seconds overwrite) and enforce the
    /// 30-day retention property in the same call.
    pub async fn insert_tick(&self, tick: &TickRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO price_log \
             (ts, price, one_minute_avg, momentum, delta_1m, delta_2m, delta_3m, delta_4m, delta_15m, delta_30m) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(ts) DO UPDATE SET
                price = excluded.price,
                one_minute_avg = excluded.one_minute_avg,
                momentum = excluded.momentum,
                delta_1m = excluded.delta_1m,
                delta_2m = excluded.delta_2m,
                delta_3m = excluded.delta_3m,
                delta_4m = excluded.delta_4m,
                delta_15m = excluded.delta_15m,
                delta_30m = excluded.delta_30m",
            params![
                tick.ts,
                tick.price,
                tick.one_minute_avg,
                tick.momentum,
                tick.delta_1m,
                tick.delta_2m,
                tick.delta_3m,
                tick.delta_4m,
                tick.delta_15m,
                tick.delta_30m,
            ],
        )?;
        conn.execute(
            "DELETE FROM price_log WHERE ts < ?1",
            params![tick.ts - RETENTION_SECS],
        )?;
        Ok(())
    }

    /// Mean price over `[since_ts, ..]`.
    pub async fn avg_price_since(&self, since_ts: i64) -> Result<Option<f64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT AVG(price) FROM price_log WHERE ts >= ?1")?;
        let avg: Option<f64> = stmt.query_row(params![since_ts], |row| row.get(0))?;
        Ok(avg)
    }

    /// Nearest tick at or before `target_ts`.
    pub async fn price_at_or_before(&self, target_ts: i64) -> Result<Option<(i64, f64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ts, price FROM price_log WHERE ts <= ?1 ORDER BY ts DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![target_ts])?;
        if let Some(row) = rows.next()? {
            Ok(Some((row.get(0)?, row.get(1)?)))
        } else {
            Ok(None)
        }
    }

    pub async fn latest(&self) -> Result<Option<TickRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ts, price, one_minute_avg, momentum, delta_1m, delta_2m, delta_3m, delta_4m, delta_15m, delta_30m \
             FROM price_log ORDER BY ts DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(TickRow {
            ts: row.get(0)?,
            price: row.get(1)?,
            one_minute_avg: row.get(2)?,
            momentum: row.get(3)?,
            delta_1m: row.get(4)?,
            delta_2m: row.get(5)?,
            delta_3m: row.get(6)?,
            delta_4m: row.get(7)?,
            delta_15m: row.get(8)?,
            delta_30m: row.get(9)?,
        }))
    }

    pub async fn count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM price_log", [], |r| r.get(0))?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts: i64, price: f64) -> TickRow {
        TickRow {
            ts,
            price,
            one_minute_avg: None,
            momentum: None,
            delta_1m: None,
            delta_2m: None,
            delta_3m: None,
            delta_4m: None,
            delta_15m: None,
            delta_30m: None,
        }
    }

    #[tokio::test]
    async fn duplicate_seconds_upsert_idempotently() {
        let store = TickStore::open_in_memory().unwrap();
        store.insert_tick(&tick(1000, 119_000.0)).await.unwrap();
        store.insert_tick(&tick(1000, 119_050.0)).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.price, 119_050.0);
    }

    #[tokio::test]
    async fn rows_older_than_window_are_evicted_on_write() {
        let store = TickStore::open_in_memory().unwrap();
        let now = 100 * RETENTION_SECS;
        store.insert_tick(&tick(now - RETENTION_SECS - 10, 1.0)).await.unwrap();
        store.insert_tick(&tick(now - 60, 2.0)).await.unwrap();
        store.insert_tick(&tick(now, 3.0)).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store
            .price_at_or_before(now - RETENTION_SECS)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn nearest_prior_lookup() {
        let store = TickStore::open_in_memory().unwrap();
        store.insert_tick(&tick(100, 1.0)).await.unwrap();
        store.insert_tick(&tick(160, 2.0)).await.unwrap();

        let (ts, price) = store.price_at_or_before(159).await.unwrap().unwrap();
        assert_eq!((ts, price), (100, 1.0));
        let (ts, _) = store.price_at_or_before(160).await.unwrap().unwrap();
        assert_eq!(ts, 160);
    }
}
