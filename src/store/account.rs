//! Mirror of broker account state: balance, positions, fills, orders,
//! settlements. Account sync is the sole writer; monetary fields are stored
//! in decimal units (centi-cents are converted on ingest).

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRow {
    pub ticker: String,
    pub total_traded: f64,
    /// Signed contract count.
    pub position: i64,
    pub market_exposure: f64,
    pub realized_pnl: f64,
    pub fees_paid: f64,
    pub last_updated_ts: i64,
    /// Raw broker payload, kept for forensics.
    pub raw: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRow {
    pub trade_id: String,
    pub ticker: String,
    pub order_id: String,
    pub side: String,
    pub action: String,
    pub count: i64,
    pub yes_price: f64,
    pub no_price: f64,
    pub is_taker: bool,
    pub created_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRow {
    pub order_id: String,
    pub ticker: String,
    pub side: String,
    pub action: String,
    pub status: String,
    pub yes_price: Option<f64>,
    pub no_price: Option<f64>,
    pub count: i64,
    pub created_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRow {
    pub ticker: String,
    pub market_result: String,
    pub revenue: f64,
    pub yes_count: i64,
    pub no_count: i64,
    pub settled_time: String,
}

#[derive(Clone)]
pub struct AccountStore {
    conn: Arc<Mutex<Connection>>,
}

impl AccountStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = super::open_connection(db_path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory account store")?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                ticker TEXT PRIMARY KEY,
                total_traded REAL NOT NULL,
                position INTEGER NOT NULL,
                market_exposure REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                fees_paid REAL NOT NULL,
                last_updated_ts INTEGER NOT NULL,
                raw TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS fills (
                trade_id TEXT PRIMARY KEY,
                ticker TEXT NOT NULL,
                order_id TEXT NOT NULL,
                side TEXT NOT NULL,
                action TEXT NOT NULL,
                count INTEGER NOT NULL,
                yes_price REAL NOT NULL,
                no_price REAL NOT NULL,
                is_taker INTEGER NOT NULL,
                created_time TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_fills_ticker_time ON fills(ticker, created_time DESC)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                ticker TEXT NOT NULL,
                side TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                yes_price REAL,
                no_price REAL,
                count INTEGER NOT NULL,
                created_time TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS settlements (
                ticker TEXT NOT NULL,
                market_result TEXT NOT NULL,
                revenue REAL NOT NULL,
                yes_count INTEGER NOT NULL,
                no_count INTEGER NOT NULL,
                settled_time TEXT NOT NULL,
                PRIMARY KEY (ticker, settled_time)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS balance (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                balance REAL NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn upsert_position(&self, row: &PositionRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO positions \
             (ticker, total_traded, position, market_exposure, realized_pnl, fees_paid, last_updated_ts, raw) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(ticker) DO UPDATE SET
                total_traded = excluded.total_traded,
                position = excluded.position,
                market_exposure = excluded.market_exposure,
                realized_pnl = excluded.realized_pnl,
                fees_paid = excluded.fees_paid,
                last_updated_ts = excluded.last_updated_ts,
                raw = excluded.raw",
            params![
                &row.ticker,
                row.total_traded,
                row.position,
                row.market_exposure,
                row.realized_pnl,
                row.fees_paid,
                row.last_updated_ts,
                &row.raw,
            ],
        )?;
        Ok(())
    }

    pub async fn position(&self, ticker: &str) -> Result<Option<PositionRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, total_traded, position, market_exposure, realized_pnl, fees_paid, \
             last_updated_ts, raw FROM positions WHERE ticker = ?1",
        )?;
        let mut rows = stmt.query(params![ticker])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(PositionRow {
            ticker: row.get(0)?,
            total_traded: row.get(1)?,
            position: row.get(2)?,
            market_exposure: row.get(3)?,
            realized_pnl: row.get(4)?,
            fees_paid: row.get(5)?,
            last_updated_ts: row.get(6)?,
            raw: row.get(7)?,
        }))
    }

    /// Insert-if-absent by broker trade id. Returns whether a row landed.
    pub async fn insert_fill(&self, row: &FillRow) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "INSERT OR IGNORE INTO fills \
             (trade_id, ticker, order_id, side, action, count, yes_price, no_price, is_taker, created_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &row.trade_id,
                &row.ticker,
                &row.order_id,
                &row.side,
                &row.action,
                row.count,
                row.yes_price,
                row.no_price,
                row.is_taker as i64,
                &row.created_time,
            ],
        )?;
        Ok(n > 0)
    }

    /// Most recent fill for a ticker on the given broker side ("yes"/"no").
    pub async fn latest_fill_on_side(&self, ticker: &str, side: &str) -> Result<Option<FillRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT trade_id, ticker, order_id, side, action, count, yes_price, no_price, is_taker, created_time \
             FROM fills WHERE ticker = ?1 AND side = ?2 ORDER BY created_time DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![ticker, side])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(FillRow {
            trade_id: row.get(0)?,
            ticker: row.get(1)?,
            order_id: row.get(2)?,
            side: row.get(3)?,
            action: row.get(4)?,
            count: row.get(5)?,
            yes_price: row.get(6)?,
            no_price: row.get(7)?,
            is_taker: row.get::<_, i64>(8)? != 0,
            created_time: row.get(9)?,
        }))
    }

    pub async fn insert_order(&self, row: &OrderRow) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "INSERT OR IGNORE INTO orders \
             (order_id, ticker, side, action, status, yes_price, no_price, count, created_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &row.order_id,
                &row.ticker,
                &row.side,
                &row.action,
                &row.status,
                row.yes_price,
                row.no_price,
                row.count,
                &row.created_time,
            ],
        )?;
        Ok(n > 0)
    }

    pub async fn insert_settlement(&self, row: &SettlementRow) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "INSERT OR IGNORE INTO settlements \
             (ticker, market_result, revenue, yes_count, no_count, settled_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &row.ticker,
                &row.market_result,
                row.revenue,
                row.yes_count,
                row.no_count,
                &row.settled_time,
            ],
        )?;
        Ok(n > 0)
    }

    pub async fn latest_settlement(&self, ticker: &str) -> Result<Option<SettlementRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, market_result, revenue, yes_count, no_count, settled_time \
             FROM settlements WHERE ticker = ?1 ORDER BY settled_time DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![ticker])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(SettlementRow {
            ticker: row.get(0)?,
            market_result: row.get(1)?,
            revenue: row.get(2)?,
            yes_count: row.get(3)?,
            no_count: row.get(4)?,
            settled_time: row.get(5)?,
        }))
    }

    pub async fn upsert_balance(&self, balance: f64, updated_at: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO balance (id, balance, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET balance = excluded.balance, updated_at = excluded.updated_at",
            params![balance, updated_at],
        )?;
        Ok(())
    }

    pub async fn balance(&self) -> Result<Option<f64>> {
        let conn = self.conn.lock().await;
        let v = conn
            .query_row("SELECT balance FROM balance WHERE id = 1", [], |row| row.get(0))
            .ok();
        Ok(v)
    }
}
