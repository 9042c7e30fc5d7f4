//! SQLite-backed stores. One store per logical table group; every mutation
//! goes through the owning component, cross-component reads are permitted.

pub mod account;
pub mod active;
pub mod ledger;
pub mod settings;
pub mod ticks;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::time::Duration;

/// Open a connection with the pragmas every store uses.
pub(crate) fn open_connection(db_path: &str) -> Result<Connection> {
    let conn = Connection::open(db_path).with_context(|| format!("open db {db_path}"))?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.busy_timeout(Duration::from_millis(250)).ok();
    Ok(conn)
}
