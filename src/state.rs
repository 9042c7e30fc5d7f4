//! Shared live-market state. Each worker owns one slice (writer); all other
//! components read. Short critical sections only, hence `parking_lot`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{MarketSnapshot, PricePoint, StrikeTableDoc};

/// Derived top-of-book for one contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookTop {
    pub ticker: String,
    pub yes_bid: Option<i64>,
    pub yes_ask: Option<i64>,
    pub no_bid: Option<i64>,
    pub no_ask: Option<i64>,
    pub volume: i64,
    pub last_update_ts: i64,
}

#[derive(Default)]
struct LiveStateInner {
    price: Option<PricePoint>,
    /// Weighted momentum score, scaled x100.
    momentum: Option<f64>,
    snapshot: Option<Arc<MarketSnapshot>>,
    strike_table: Option<Arc<StrikeTableDoc>>,
    watchlist: Option<Arc<StrikeTableDoc>>,
    book_tops: HashMap<String, BookTop>,
    /// Component name -> unix seconds of last sign of life.
    heartbeats: HashMap<String, i64>,
}

#[derive(Clone, Default)]
pub struct LiveState {
    inner: Arc<RwLock<LiveStateInner>>,
}

impl LiveState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, point: PricePoint) {
        self.inner.write().price = Some(point);
    }

    pub fn price(&self) -> Option<PricePoint> {
        self.inner.read().price
    }

    pub fn set_momentum(&self, momentum: f64) {
        self.inner.write().momentum = Some(momentum);
    }

    pub fn momentum(&self) -> Option<f64> {
        self.inner.read().momentum
    }

    pub fn set_snapshot(&self, snapshot: MarketSnapshot) {
        self.inner.write().snapshot = Some(Arc::new(snapshot));
    }

    pub fn snapshot(&self) -> Option<Arc<MarketSnapshot>> {
        self.inner.read().snapshot.clone()
    }

    pub fn set_strike_table(&self, doc: StrikeTableDoc) {
        self.inner.write().strike_table = Some(Arc::new(doc));
    }

    pub fn strike_table(&self) -> Option<Arc<StrikeTableDoc>> {
        self.inner.read().strike_table.clone()
    }

    pub fn set_watchlist(&self, doc: StrikeTableDoc) {
        self.inner.write().watchlist = Some(Arc::new(doc));
    }

    pub fn watchlist(&self) -> Option<Arc<StrikeTableDoc>> {
        self.inner.read().watchlist.clone()
    }

    pub fn set_book_top(&self, top: BookTop) {
        self.inner.write().book_tops.insert(top.ticker.clone(), top);
    }

    pub fn book_top(&self, ticker: &str) -> Option<BookTop> {
        self.inner.read().book_tops.get(ticker).cloned()
    }

    pub fn book_tops(&self) -> Vec<BookTop> {
        self.inner.read().book_tops.values().cloned().collect()
    }

    pub fn clear_book(&self) {
        self.inner.write().book_tops.clear();
    }

    pub fn heartbeat(&self, component: &str) {
        self.inner
            .write()
            .heartbeats
            .insert(component.to_string(), chrono::Utc::now().timestamp());
    }

    pub fn heartbeats(&self) -> HashMap<String, i64> {
        self.inner.read().heartbeats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_are_independent() {
        let state = LiveState::new();
        assert!(state.price().is_none());

        state.set_price(PricePoint {
            ts: 100,
            price: 119_050.0,
        });
        state.set_momentum(5.0);

        assert_eq!(state.price().unwrap().price, 119_050.0);
        assert_eq!(state.momentum(), Some(5.0));
        assert!(state.snapshot().is_none());
    }

    #[test]
    fn book_tops_replace_by_ticker() {
        let state = LiveState::new();
        let top = |ask| BookTop {
            ticker: "T1".into(),
            yes_bid: Some(92),
            yes_ask: Some(ask),
            no_bid: Some(6),
            no_ask: Some(8),
            volume: 1500,
            last_update_ts: 0,
        };
        state.set_book_top(top(93));
        state.set_book_top(top(94));
        assert_eq!(state.book_top("T1").unwrap().yes_ask, Some(94));
        assert_eq!(state.book_tops().len(), 1);
    }
}
