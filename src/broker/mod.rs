//! Broker adapter: signed REST client, wire types, and the capability
//! trait the rest of the system depends on.

pub mod client;
pub mod sign;
pub mod types;

pub use client::{BrokerApi, KalshiClient};
pub use sign::RequestSigner;
