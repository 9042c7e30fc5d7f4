//! Active-trade monitoring table. A row exists exactly while the ledger
//! trade is `open`; the active-trade supervisor owns all writes.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{ActiveTrade, Side, Trade};

#[derive(Clone)]
pub struct ActiveTradeStore {
    conn: Arc<Mutex<Connection>>,
}

impl ActiveTradeStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = super::open_connection(db_path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory active-trade store")?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS active_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id INTEGER NOT NULL UNIQUE,
                ticket_id TEXT NOT NULL,
                date TEXT NOT NULL,
                time TEXT NOT NULL,
                strike REAL NOT NULL,
                side TEXT NOT NULL,
                buy_price REAL NOT NULL,
                position INTEGER NOT NULL,
                prob REAL,
                ticker TEXT NOT NULL,
                momentum INTEGER,
                status TEXT NOT NULL DEFAULT 'active',
                current_symbol_price REAL,
                current_probability REAL,
                buffer_from_entry REAL,
                time_since_entry INTEGER,
                current_close_price REAL,
                current_pnl TEXT,
                last_updated TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_active_trades_ticker ON active_trades(ticker)",
            [],
        )?;
        Ok(())
    }

    /// Mirror an `open` ledger trade. Idempotent per `trade_id`.
    pub async fn insert_from_trade(&self, trade: &Trade) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "INSERT OR IGNORE INTO active_trades \
             (trade_id, ticket_id, date, time, strike, side, buy_price, position, prob, ticker, momentum) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trade.id,
                &trade.ticket_id,
                &trade.date,
                &trade.time,
                trade.strike,
                trade.side.as_str(),
                trade.buy_price,
                trade.position,
                trade.prob,
                &trade.ticker,
                trade.momentum,
            ],
        )?;
        Ok(n > 0)
    }

    pub async fn remove(&self, trade_id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM active_trades WHERE trade_id = ?1",
            params![trade_id],
        )?;
        Ok(n > 0)
    }

    pub async fn count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM active_trades", [], |r| r.get(0))?;
        Ok(n)
    }

    pub async fn all(&self) -> Result<Vec<ActiveTrade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!("{SELECT_ACTIVE} ORDER BY trade_id ASC"))?;
        let rows = stmt.query_map([], |row| {
            active_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn get_by_trade_id(&self, trade_id: i64) -> Result<Option<ActiveTrade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!("{SELECT_ACTIVE} WHERE trade_id = ?1"))?;
        let mut rows = stmt.query(params![trade_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(active_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Duplicate-trade guard input: does a monitored trade already exist on
    /// this strike and side?
    pub async fn exists_for_strike_side(&self, strike: f64, side: Side) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM active_trades WHERE strike = ?1 AND side = ?2",
            params![strike, side.as_str()],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// Write one monitoring pass for a trade.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_monitoring(
        &self,
        trade_id: i64,
        current_symbol_price: f64,
        current_probability: Option<f64>,
        buffer_from_entry: f64,
        time_since_entry: i64,
        current_close_price: f64,
        current_pnl: &str,
        last_updated: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE active_trades SET
                current_symbol_price = ?1,
                current_probability = ?2,
                buffer_from_entry = ?3,
                time_since_entry = ?4,
                current_close_price = ?5,
                current_pnl = ?6,
                last_updated = ?7
             WHERE trade_id = ?8",
            params![
                current_symbol_price,
                current_probability,
                buffer_from_entry,
                time_since_entry,
                current_close_price,
                current_pnl,
                last_updated,
                trade_id,
            ],
        )?;
        Ok(())
    }
}

const SELECT_ACTIVE: &str = "SELECT id, trade_id, ticket_id, date, time, strike, side, buy_price, \
    position, prob, ticker, momentum, status, current_symbol_price, current_probability, \
    buffer_from_entry, time_since_entry, current_close_price, current_pnl, last_updated FROM active_trades";

fn active_from_row(row: &Row<'_>) -> Result<ActiveTrade> {
    let side: String = row.get(6)?;
    Ok(ActiveTrade {
        id: row.get(0)?,
        trade_id: row.get(1)?,
        ticket_id: row.get(2)?,
        date: row.get(3)?,
        time: row.get(4)?,
        strike: row.get(5)?,
        side: Side::parse(&side).context("bad side in active trade row")?,
        buy_price: row.get(7)?,
        position: row.get(8)?,
        prob: row.get(9)?,
        ticker: row.get(10)?,
        momentum: row.get(11)?,
        status: row.get(12)?,
        current_symbol_price: row.get(13)?,
        current_probability: row.get(14)?,
        buffer_from_entry: row.get(15)?,
        time_since_entry: row.get(16)?,
        current_close_price: row.get(17)?,
        current_pnl: row.get(18)?,
        last_updated: row.get(19)?,
    })
}
