//! Core domain types shared across the trade lifecycle engine.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Exchange-facing timestamps use this timezone; internal ordering is UTC.
pub const EXCHANGE_TZ: Tz = chrono_tz::America::New_York;

/// Current wall-clock time in the exchange timezone.
pub fn now_exchange() -> DateTime<Tz> {
    Utc::now().with_timezone(&EXCHANGE_TZ)
}

/// Contract side of a binary-option trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "Y", alias = "yes", alias = "YES")]
    Yes,
    #[serde(rename = "N", alias = "no", alias = "NO")]
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "Y",
            Side::No => "N",
        }
    }

    /// Lowercase form used on the broker wire ("yes" / "no").
    pub fn broker_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn invert(&self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s.trim() {
            "Y" | "y" | "yes" | "YES" | "Yes" => Some(Side::Yes),
            "N" | "n" | "no" | "NO" | "No" => Some(Side::No),
            _ => None,
        }
    }
}

/// Ledger trade status. Transitions are one-way; `closed` and `error` are
/// terminal, `expired` resolves to `closed` once a settlement is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Open,
    Closing,
    Closed,
    Expired,
    Error,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Open => "open",
            TradeStatus::Closing => "closing",
            TradeStatus::Closed => "closed",
            TradeStatus::Expired => "expired",
            TradeStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<TradeStatus> {
        match s {
            "pending" => Some(TradeStatus::Pending),
            "open" => Some(TradeStatus::Open),
            "closing" => Some(TradeStatus::Closing),
            "closed" => Some(TradeStatus::Closed),
            "expired" => Some(TradeStatus::Expired),
            "error" => Some(TradeStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Closed | TradeStatus::Error)
    }

    /// Legal forward edges of the trade state machine.
    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        use TradeStatus::*;
        matches!(
            (self, next),
            (Pending, Open)
                | (Pending, Error)
                | (Open, Closing)
                | (Open, Expired)
                | (Closing, Closed)
                | (Expired, Closed)
        )
    }
}

/// Win/loss/draw classification of a closed trade, by PnL sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WinLoss {
    #[serde(rename = "W")]
    Win,
    #[serde(rename = "L")]
    Loss,
    #[serde(rename = "D")]
    Draw,
}

impl WinLoss {
    pub fn as_str(&self) -> &'static str {
        match self {
            WinLoss::Win => "W",
            WinLoss::Loss => "L",
            WinLoss::Draw => "D",
        }
    }

    pub fn from_pnl(pnl: f64) -> WinLoss {
        if pnl > 0.0 {
            WinLoss::Win
        } else if pnl < 0.0 {
            WinLoss::Loss
        } else {
            WinLoss::Draw
        }
    }

    pub fn parse(s: &str) -> Option<WinLoss> {
        match s {
            "W" => Some(WinLoss::Win),
            "L" => Some(WinLoss::Loss),
            "D" => Some(WinLoss::Draw),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryMethod {
    Manual,
    Auto,
}

impl EntryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryMethod::Manual => "manual",
            EntryMethod::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<EntryMethod> {
        match s {
            "manual" => Some(EntryMethod::Manual),
            "auto" => Some(EntryMethod::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketIntent {
    Open,
    Close,
}

/// Canonical trade ticket minted by the initiator. One ticket per intent;
/// the close path mints a fresh ticket with the side inverted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeTicket {
    pub ticket_id: String,
    pub intent: TicketIntent,
    /// Ledger id of the trade being closed; `None` for open tickets.
    pub close_trade_id: Option<i64>,
    pub date: String,
    pub time: String,
    pub symbol: String,
    pub market: String,
    pub trade_strategy: String,
    pub contract: String,
    pub strike: f64,
    pub side: Side,
    pub ticker: String,
    pub buy_price: f64,
    pub sell_price: Option<f64>,
    pub position: i64,
    pub prob: Option<f64>,
    pub symbol_open: Option<f64>,
    pub symbol_close: Option<f64>,
    pub momentum: Option<i64>,
    pub entry_method: EntryMethod,
    pub close_method: Option<String>,
}

/// Ledger row. The trade manager is the only writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub ticket_id: String,
    pub date: String,
    pub time: String,
    pub symbol: String,
    pub market: String,
    pub trade_strategy: String,
    pub contract: String,
    pub strike: f64,
    pub side: Side,
    pub ticker: String,
    pub prob: Option<f64>,
    pub position: i64,
    pub buy_price: f64,
    pub entry_method: EntryMethod,
    pub status: TradeStatus,
    pub symbol_open: Option<f64>,
    pub symbol_close: Option<f64>,
    pub sell_price: Option<f64>,
    pub closed_at: Option<String>,
    pub fees: Option<f64>,
    pub pnl: Option<f64>,
    pub win_loss: Option<WinLoss>,
    pub diff: Option<i64>,
    pub close_method: Option<String>,
    pub momentum: Option<i64>,
}

/// Trade request accepted by the initiator's open path. Auto entry and the
/// UI both submit this shape; the initiator normalizes it into a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTradeRequest {
    pub strike: f64,
    pub side: Side,
    pub ticker: String,
    pub buy_price: f64,
    pub prob: f64,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub contract: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
    pub entry_method: EntryMethod,
}

/// One row of the per-second strike table artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrikeRow {
    pub strike: i64,
    pub buffer: f64,
    pub buffer_pct: f64,
    pub probability: f64,
    pub yes_ask: f64,
    pub no_ask: f64,
    pub yes_diff: f64,
    pub no_diff: f64,
    pub volume: i64,
    pub ticker: String,
    /// Side favored by the money line; the side auto entry would buy.
    pub active_side: Side,
}

impl StrikeRow {
    /// Differential on the favored side.
    pub fn active_diff(&self) -> f64 {
        match self.active_side {
            Side::Yes => self.yes_diff,
            Side::No => self.no_diff,
        }
    }

    pub fn active_ask(&self) -> f64 {
        match self.active_side {
            Side::Yes => self.yes_ask,
            Side::No => self.no_ask,
        }
    }
}

/// Strike-table / watchlist artifact consumed by the UI and auto entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrikeTableDoc {
    pub symbol: String,
    pub current_price: f64,
    pub ttc: i64,
    pub broker: String,
    pub event_ticker: String,
    pub market_title: String,
    pub strike_tier: i64,
    pub market_status: String,
    pub last_updated: String,
    pub strikes: Vec<StrikeRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveProbability {
    pub strike: i64,
    pub prob_within: f64,
    pub direction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveProbabilitiesDoc {
    pub timestamp: String,
    pub current_price: f64,
    pub ttc_seconds: i64,
    pub probabilities: Vec<LiveProbability>,
}

/// Monitoring row owned by the active-trade supervisor. Exists iff the
/// ledger trade is `open`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTrade {
    pub id: i64,
    pub trade_id: i64,
    pub ticket_id: String,
    pub date: String,
    pub time: String,
    pub strike: f64,
    pub side: Side,
    pub buy_price: f64,
    pub position: i64,
    pub prob: Option<f64>,
    pub ticker: String,
    pub momentum: Option<i64>,
    pub status: String,
    pub current_symbol_price: Option<f64>,
    pub current_probability: Option<f64>,
    pub buffer_from_entry: Option<f64>,
    pub time_since_entry: Option<i64>,
    pub current_close_price: Option<f64>,
    pub current_pnl: Option<String>,
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTradesDoc {
    pub timestamp: String,
    pub count: usize,
    pub active_trades: Vec<ActiveTrade>,
}

/// Auto-entry indicator document broadcast to the UI on every state change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoEntryIndicator {
    pub enabled: bool,
    pub ttc_within_window: bool,
    pub scanning_active: bool,
    pub service_healthy: bool,
    pub spike_alert_active: bool,
    pub spike_alert_momentum_value: Option<f64>,
    pub spike_alert_recovery_countdown: Option<f64>,
    pub current_momentum: Option<f64>,
    pub current_ttc: i64,
    pub min_time: Option<i64>,
    pub max_time: Option<i64>,
    pub last_updated: Option<String>,
}

/// Typed events on the in-process bus. Delivery is best-effort; consumers
/// that fall behind drop events rather than queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    PriceUpdate {
        symbol: String,
        price: f64,
        ts: i64,
    },
    MarketUpdate {
        event_ticker: String,
        ts: i64,
    },
    TradeChanged {
        trade_id: i64,
        ticket_id: String,
        status: TradeStatus,
    },
    PositionUpdate {
        ticker: String,
    },
    DbChanged {
        db_name: String,
    },
    IndicatorUpdate {
        indicator: AutoEntryIndicator,
    },
    SystemHealth {
        component: String,
        healthy: bool,
    },
}

/// Latest price observation from the ticker feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePoint {
    /// Unix seconds, UTC.
    pub ts: i64,
    pub price: f64,
}

/// One strike market inside an hourly event snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketQuote {
    pub ticker: String,
    /// Broker convention: one cent below the round strike.
    pub floor_strike: f64,
    /// Round strike value.
    pub strike: i64,
    pub yes_bid: i64,
    pub yes_ask: i64,
    pub no_bid: i64,
    pub no_ask: i64,
    pub last_price: i64,
    pub volume: i64,
    pub volume_24h: i64,
    pub open_interest: i64,
}

/// Snapshot of the active hourly event and its strike ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub event_ticker: String,
    pub event_title: String,
    /// UTC expiry of the event.
    pub strike_date: DateTime<Utc>,
    pub market_status: String,
    /// Observed common spacing between strikes.
    pub strike_tier: i64,
    pub markets: Vec<MarketQuote>,
    /// Unix seconds the snapshot was fetched, UTC.
    pub fetched_at: i64,
}

impl MarketSnapshot {
    /// Seconds until the hourly event expires, floored at zero.
    pub fn ttc_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.strike_date - now).num_seconds().max(0)
    }

    pub fn market_for_strike(&self, strike: i64) -> Option<&MarketQuote> {
        self.markets.iter().find(|m| m.strike == strike)
    }

    pub fn market_for_ticker(&self, ticker: &str) -> Option<&MarketQuote> {
        self.markets.iter().find(|m| m.ticker == ticker)
    }
}

/// Shorten a contract display name to the compact ledger form, e.g.
/// "BTC price today, expiring at 3pm EDT" -> "BTC 3pm". Short "BTC " names
/// pass through unchanged; so does anything without an "at <hour><am|pm>"
/// time.
pub fn truncate_contract_name(name: &str) -> String {
    if name.is_empty() {
        return name.to_string();
    }
    if name.starts_with("BTC ") && name.len() < 20 {
        return name.to_string();
    }
    if let Some((hour, ampm)) = extract_expiry_time(name) {
        return format!("BTC {hour}{ampm}");
    }
    name.to_string()
}

/// Case-insensitive scan for "at <digits>(am|pm)" in a display name.
fn extract_expiry_time(name: &str) -> Option<(String, &'static str)> {
    let lower = name.to_lowercase();
    let mut search = 0;
    while let Some(pos) = lower[search..].find("at ") {
        let start = search + pos + 3;
        let digits_end = lower[start..]
            .find(|c: char| !c.is_ascii_digit())
            .map(|i| start + i)
            .unwrap_or(lower.len());
        if digits_end > start {
            let rest = &lower[digits_end..];
            let ampm = if rest.starts_with("am") {
                Some("am")
            } else if rest.starts_with("pm") {
                Some("pm")
            } else {
                None
            };
            if let Some(ampm) = ampm {
                return Some((lower[start..digits_end].to_string(), ampm));
            }
        }
        search = search + pos + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_one_way() {
        use TradeStatus::*;
        assert!(Pending.can_transition_to(Open));
        assert!(Pending.can_transition_to(Error));
        assert!(Open.can_transition_to(Closing));
        assert!(Open.can_transition_to(Expired));
        assert!(Closing.can_transition_to(Closed));
        assert!(Expired.can_transition_to(Closed));

        assert!(!Open.can_transition_to(Pending));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Error.can_transition_to(Pending));
        assert!(!Closed.can_transition_to(Expired));
        assert!(!Closing.can_transition_to(Expired));
    }

    #[test]
    fn win_loss_by_sign() {
        assert_eq!(WinLoss::from_pnl(0.42), WinLoss::Win);
        assert_eq!(WinLoss::from_pnl(-2.91), WinLoss::Loss);
        assert_eq!(WinLoss::from_pnl(0.0), WinLoss::Draw);
    }

    #[test]
    fn side_roundtrip() {
        assert_eq!(Side::parse("yes"), Some(Side::Yes));
        assert_eq!(Side::parse("N"), Some(Side::No));
        assert_eq!(Side::Yes.invert(), Side::No);
        assert_eq!(Side::No.broker_str(), "no");
    }

    #[test]
    fn contract_name_shortening() {
        // Short "BTC " names pass through.
        assert_eq!(truncate_contract_name("BTC Market"), "BTC Market");
        assert_eq!(truncate_contract_name("BTC 3pm"), "BTC 3pm");

        // Long names reduce to the expiry time.
        assert_eq!(
            truncate_contract_name("Bitcoin price today, expiring at 3pm EDT?"),
            "BTC 3pm"
        );
        assert_eq!(
            truncate_contract_name("BTC Hourly contract expiring at 11PM"),
            "BTC 11pm"
        );

        // No time match: the name survives untouched, never clipped.
        let no_time = "Some market title without an expiry time in it at all";
        assert_eq!(truncate_contract_name(no_time), no_time);
        assert_eq!(truncate_contract_name(""), "");
    }
}
