//! Market-data workers: price ticker, hourly event snapshots, orderbook
//! deltas.

pub mod market_snapshot;
pub mod orderbook;
pub mod price_feed;
