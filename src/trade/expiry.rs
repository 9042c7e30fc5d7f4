//! Expiry scheduler: fires at every top of hour in the exchange timezone
//! (hour boundaries coincide with UTC ones) and runs the manager's expiry
//! cycle: delete errors, mark still-open trades expired, poll settlements.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::trade::manager::TradeManager;

pub struct ExpiryScheduler {
    manager: Arc<TradeManager>,
}

impl ExpiryScheduler {
    pub fn new(manager: Arc<TradeManager>) -> Self {
        Self { manager }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let wait = seconds_to_next_hour(chrono::Utc::now().timestamp());
                sleep(Duration::from_secs(wait)).await;
                info!("hourly boundary reached, running expiry cycle");
                if let Err(e) = self.manager.run_expiry_cycle().await {
                    warn!(error = %e, "expiry cycle failed");
                }
                // Skip past the boundary second before rescheduling.
                sleep(Duration::from_secs(1)).await;
            }
        })
    }
}

fn seconds_to_next_hour(now_ts: i64) -> u64 {
    let rem = now_ts.rem_euclid(3600);
    ((3600 - rem) % 3600).max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_math() {
        // 14:05:09 -> 54 min 51 s to go.
        assert_eq!(seconds_to_next_hour(14 * 3600 + 5 * 60 + 9), 54 * 60 + 51);
        // Exactly on a boundary: wait the minimum, not a full hour of zero.
        assert_eq!(seconds_to_next_hour(7200), 1);
        assert_eq!(seconds_to_next_hour(7199), 1);
    }
}
