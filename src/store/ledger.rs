//! Trade ledger. The trade manager is the sole writer; status transitions
//! are validated against the trade state machine before any update lands.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::models::{EntryMethod, Side, Trade, TradeStatus, TradeTicket, WinLoss};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketLogRow {
    pub ticket_id: String,
    pub ts: String,
    pub service: String,
    pub message: String,
}

#[derive(Clone)]
pub struct TradeLedger {
    conn: Arc<Mutex<Connection>>,
}

impl TradeLedger {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = super::open_connection(db_path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory ledger")?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id TEXT NOT NULL UNIQUE,
                date TEXT NOT NULL,
                time TEXT NOT NULL,
                symbol TEXT NOT NULL,
                market TEXT NOT NULL,
                trade_strategy TEXT NOT NULL,
                contract TEXT NOT NULL,
                strike REAL NOT NULL,
                side TEXT NOT NULL,
                ticker TEXT NOT NULL,
                prob REAL,
                position INTEGER NOT NULL,
                buy_price REAL NOT NULL,
                entry_method TEXT NOT NULL,
                status TEXT NOT NULL,
                symbol_open REAL,
                symbol_close REAL,
                sell_price REAL,
                closed_at TEXT,
                fees REAL,
                pnl REAL,
                win_loss TEXT,
                diff INTEGER,
                close_method TEXT,
                momentum INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_ticker ON trades(ticker)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS ticket_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                service TEXT NOT NULL,
                message TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ticket_log_ticket ON ticket_log(ticket_id)",
            [],
        )?;
        Ok(())
    }

    /// Persist an open ticket as a `pending` ledger row. Duplicate ticket
    /// ids are rejected by the unique constraint.
    pub async fn insert_open_ticket(&self, ticket: &TradeTicket) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trades \
             (ticket_id, date, time, symbol, market, trade_strategy, contract, strike, side, ticker, \
              prob, position, buy_price, entry_method, status, symbol_open, momentum) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 'pending', ?15, ?16)",
            params![
                &ticket.ticket_id,
                &ticket.date,
                &ticket.time,
                &ticket.symbol,
                &ticket.market,
                &ticket.trade_strategy,
                &ticket.contract,
                ticket.strike,
                ticket.side.as_str(),
                &ticket.ticker,
                ticket.prob,
                ticket.position,
                ticket.buy_price,
                ticket.entry_method.as_str(),
                ticket.symbol_open,
                ticket.momentum,
            ],
        )
        .context("insert open ticket")?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!("{SELECT_TRADE} WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(trade_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn by_status(&self, status: TradeStatus) -> Result<Vec<Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("{SELECT_TRADE} WHERE status = ?1 ORDER BY id ASC"))?;
        let rows = stmt.query_map(params![status.as_str()], |row| {
            trade_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn all_recent(&self, limit: usize) -> Result<Vec<Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("{SELECT_TRADE} ORDER BY id DESC LIMIT ?1"))?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            trade_from_row(row).map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Validated status transition. Returns `false` (and logs) when the edge
    /// is not in the state machine; the row is left untouched.
    pub async fn update_status(&self, id: i64, next: TradeStatus) -> Result<bool> {
        let conn = self.conn.lock().await;
        Self::transition(&conn, id, next)
    }

    fn transition(conn: &Connection, id: i64, next: TradeStatus) -> Result<bool> {
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM trades WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .ok();
        let Some(current) = current.and_then(|s| TradeStatus::parse(&s)) else {
            warn!(trade_id = id, "status update for unknown trade");
            return Ok(false);
        };
        if !current.can_transition_to(next) {
            warn!(
                trade_id = id,
                from = current.as_str(),
                to = next.as_str(),
                "refusing illegal trade status transition"
            );
            return Ok(false);
        }
        conn.execute(
            "UPDATE trades SET status = ?1 WHERE id = ?2",
            params![next.as_str(), id],
        )?;
        Ok(true)
    }

    /// Pending -> open with the fields read off the positions mirror.
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_open(
        &self,
        id: i64,
        position: i64,
        buy_price: f64,
        fees: Option<f64>,
        diff: Option<i64>,
        symbol_open: Option<f64>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        if !Self::transition(&conn, id, TradeStatus::Open)? {
            return Ok(false);
        }
        conn.execute(
            "UPDATE trades SET position = ?1, buy_price = ?2, fees = ?3, diff = ?4, \
             symbol_open = COALESCE(?5, symbol_open) WHERE id = ?6",
            params![position, buy_price, fees, diff, symbol_open, id],
        )?;
        Ok(true)
    }

    pub async fn mark_closing(&self, id: i64, close_method: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        if !Self::transition(&conn, id, TradeStatus::Closing)? {
            return Ok(false);
        }
        conn.execute(
            "UPDATE trades SET close_method = ?1, symbol_close = NULL WHERE id = ?2",
            params![close_method, id],
        )?;
        Ok(true)
    }

    /// Closing -> closed with the reconciled economics.
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_closed(
        &self,
        id: i64,
        sell_price: f64,
        symbol_close: Option<f64>,
        fees: Option<f64>,
        pnl: f64,
        win_loss: WinLoss,
        closed_at: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        if !Self::transition(&conn, id, TradeStatus::Closed)? {
            return Ok(false);
        }
        conn.execute(
            "UPDATE trades SET sell_price = ?1, symbol_close = ?2, fees = ?3, pnl = ?4, \
             win_loss = ?5, closed_at = ?6 WHERE id = ?7",
            params![sell_price, symbol_close, fees, pnl, win_loss.as_str(), closed_at, id],
        )?;
        Ok(true)
    }

    pub async fn mark_error(&self, id: i64) -> Result<bool> {
        self.update_status(id, TradeStatus::Error).await
    }

    /// Hourly boundary: every still-open trade becomes `expired`.
    /// Returns the affected `(id, ticket_id, ticker)` triples.
    pub async fn mark_expired_open_trades(
        &self,
        closed_at: &str,
        symbol_close: Option<f64>,
    ) -> Result<Vec<(i64, String, String)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT id, ticket_id, ticker FROM trades WHERE status = 'open'")?;
        let open: Vec<(i64, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        for (id, _, _) in &open {
            if Self::transition(&conn, *id, TradeStatus::Expired)? {
                conn.execute(
                    "UPDATE trades SET closed_at = ?1, symbol_close = ?2, close_method = 'expired' \
                     WHERE id = ?3",
                    params![closed_at, symbol_close, id],
                )?;
            }
        }
        Ok(open)
    }

    /// Resolve an expired trade against a settlement.
    pub async fn settle_expired(
        &self,
        ticker: &str,
        sell_price: f64,
        fees: Option<f64>,
    ) -> Result<Option<(i64, String, f64)>> {
        let conn = self.conn.lock().await;
        let row: Option<(i64, String, f64, i64, Option<f64>)> = conn
            .query_row(
                "SELECT id, ticket_id, buy_price, position, fees FROM trades \
                 WHERE ticker = ?1 AND status = 'expired' ORDER BY id DESC LIMIT 1",
                params![ticker],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .ok();
        let Some((id, ticket_id, buy_price, position, stored_fees)) = row else {
            return Ok(None);
        };

        let fees = fees.or(stored_fees).unwrap_or(0.0);
        let pnl = round2(position as f64 * sell_price - position as f64 * buy_price - fees);
        let win_loss = WinLoss::from_pnl(pnl);

        if !Self::transition(&conn, id, TradeStatus::Closed)? {
            return Ok(None);
        }
        conn.execute(
            "UPDATE trades SET sell_price = ?1, pnl = ?2, win_loss = ?3, fees = ?4 WHERE id = ?5",
            params![sell_price, pnl, win_loss.as_str(), fees, id],
        )?;
        Ok(Some((id, ticket_id, pnl)))
    }

    /// Error trades are purged before expiry processing each hour.
    pub async fn delete_error_trades(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM trades WHERE status = 'error'", [])?;
        Ok(n)
    }

    pub async fn log_ticket_event(&self, ticket_id: &str, service: &str, message: &str) {
        let ts = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        if let Err(e) = conn.execute(
            "INSERT INTO ticket_log (ticket_id, ts, service, message) VALUES (?1, ?2, ?3, ?4)",
            params![ticket_id, ts, service, message],
        ) {
            warn!(error = %e, ticket_id, "ticket log write failed");
        }
    }

    pub async fn ticket_log(&self, ticket_id: &str) -> Result<Vec<TicketLogRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ticket_id, ts, service, message FROM ticket_log \
             WHERE ticket_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![ticket_id], |row| {
            Ok(TicketLogRow {
                ticket_id: row.get(0)?,
                ts: row.get(1)?,
                service: row.get(2)?,
                message: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

const SELECT_TRADE: &str = "SELECT id, ticket_id, date, time, symbol, market, trade_strategy, \
    contract, strike, side, ticker, prob, position, buy_price, entry_method, status, symbol_open, \
    symbol_close, sell_price, closed_at, fees, pnl, win_loss, diff, close_method, momentum FROM trades";

fn trade_from_row(row: &Row<'_>) -> Result<Trade> {
    let side: String = row.get(9)?;
    let entry_method: String = row.get(14)?;
    let status: String = row.get(15)?;
    let win_loss: Option<String> = row.get(22)?;
    Ok(Trade {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        date: row.get(2)?,
        time: row.get(3)?,
        symbol: row.get(4)?,
        market: row.get(5)?,
        trade_strategy: row.get(6)?,
        contract: row.get(7)?,
        strike: row.get(8)?,
        side: Side::parse(&side).context("bad side in ledger row")?,
        ticker: row.get(10)?,
        prob: row.get(11)?,
        position: row.get(12)?,
        buy_price: row.get(13)?,
        entry_method: EntryMethod::parse(&entry_method).context("bad entry_method")?,
        status: TradeStatus::parse(&status).context("bad status in ledger row")?,
        symbol_open: row.get(16)?,
        symbol_close: row.get(17)?,
        sell_price: row.get(18)?,
        closed_at: row.get(19)?,
        fees: row.get(20)?,
        pnl: row.get(21)?,
        win_loss: win_loss.as_deref().and_then(WinLoss::parse),
        diff: row.get(23)?,
        close_method: row.get(24)?,
        momentum: row.get(25)?,
    })
}

/// Two-decimal rounding used for all ledger money math.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TicketIntent;

    fn ticket(ticket_id: &str) -> TradeTicket {
        TradeTicket {
            ticket_id: ticket_id.to_string(),
            intent: TicketIntent::Open,
            close_trade_id: None,
            date: "2026-01-17".into(),
            time: "14:05:09".into(),
            symbol: "BTC".into(),
            market: "Kalshi".into(),
            trade_strategy: "Hourly HTC".into(),
            contract: "BTC 3pm".into(),
            strike: 119_000.0,
            side: Side::Yes,
            ticker: "KXBTCD-26JAN1715-T119000".into(),
            buy_price: 0.93,
            sell_price: None,
            position: 3,
            prob: Some(95.5),
            symbol_open: Some(119_050.0),
            symbol_close: None,
            momentum: Some(5),
            entry_method: EntryMethod::Auto,
            close_method: None,
        }
    }

    #[tokio::test]
    async fn ticket_ids_are_unique() {
        let ledger = TradeLedger::open_in_memory().unwrap();
        ledger.insert_open_ticket(&ticket("TICKET-A")).await.unwrap();
        assert!(ledger.insert_open_ticket(&ticket("TICKET-A")).await.is_err());
    }

    #[tokio::test]
    async fn illegal_transitions_are_refused() {
        let ledger = TradeLedger::open_in_memory().unwrap();
        let id = ledger.insert_open_ticket(&ticket("TICKET-B")).await.unwrap();

        // pending -> closing skips a state
        assert!(!ledger.update_status(id, TradeStatus::Closing).await.unwrap());
        assert!(ledger.update_status(id, TradeStatus::Open).await.unwrap());
        assert!(!ledger.update_status(id, TradeStatus::Pending).await.unwrap());

        let trade = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
    }

    #[tokio::test]
    async fn open_fields_land_on_confirmation() {
        let ledger = TradeLedger::open_in_memory().unwrap();
        let id = ledger.insert_open_ticket(&ticket("TICKET-C")).await.unwrap();

        assert!(ledger
            .mark_open(id, 3, 0.93, Some(0.20), Some(2), Some(119_055.0))
            .await
            .unwrap());
        let trade = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.position, 3);
        assert_eq!(trade.buy_price, 0.93);
        assert_eq!(trade.diff, Some(2));
    }

    #[tokio::test]
    async fn expiry_then_settlement_resolves_to_closed() {
        let ledger = TradeLedger::open_in_memory().unwrap();
        let id = ledger.insert_open_ticket(&ticket("TICKET-D")).await.unwrap();
        ledger.mark_open(id, 3, 0.93, Some(0.20), None, None).await.unwrap();

        let expired = ledger
            .mark_expired_open_trades("15:00:00", Some(119_200.0))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);

        // Winning settlement: sell price 1.00.
        let (settled_id, _, pnl) = ledger
            .settle_expired("KXBTCD-26JAN1715-T119000", 1.0, Some(0.20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled_id, id);
        assert_eq!(pnl, round2(3.0 * 1.0 - 3.0 * 0.93 - 0.20));

        let trade = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.win_loss, Some(WinLoss::from_pnl(pnl)));
        assert_eq!(trade.sell_price, Some(1.0));
    }

    #[tokio::test]
    async fn error_trades_are_purged() {
        let ledger = TradeLedger::open_in_memory().unwrap();
        let id = ledger.insert_open_ticket(&ticket("TICKET-E")).await.unwrap();
        ledger.mark_error(id).await.unwrap();
        assert_eq!(ledger.delete_error_trades().await.unwrap(), 1);
        assert!(ledger.get(id).await.unwrap().is_none());
    }

    #[test]
    fn round2_matches_ledger_precision() {
        assert_eq!(round2(3.0 * 0.06 - 3.0 * 0.93 - 0.30), -2.91);
        assert_eq!(round2(0.005), 0.01);
    }
}
