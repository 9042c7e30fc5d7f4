//! Trade lifecycle: initiator, manager, executor, active-trade supervisor
//! and the hourly expiry scheduler.

pub mod executor;
pub mod expiry;
pub mod initiator;
pub mod manager;
pub mod monitor;
