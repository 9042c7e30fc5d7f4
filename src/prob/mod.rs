//! Pre-computed probability lookup surface.
//!
//! A flat read-only table keyed by `(ttc_seconds, buffer_points,
//! momentum_bucket)`. Runtime access is a point lookup with nearest-step
//! key rounding; inputs outside the table domain are clamped, and buffers
//! below a quarter step use a linear ramp from 100% at zero buffer down to
//! the value at the first step.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Key steps of the generated table.
pub const TTC_STEP: i64 = 5;
pub const BUFFER_STEP: i64 = 10;

/// Momentum scores outside this range share the edge buckets.
const MOMENTUM_CLAMP: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Upward move of at least the buffer.
    Positive,
    /// Downward move of at least the buffer.
    Negative,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Positive => "positive",
            Direction::Negative => "negative",
        }
    }

    /// Direction that would cross the strike, given where it sits relative
    /// to the current price.
    pub fn for_strike(strike: f64, price: f64) -> Direction {
        if strike < price {
            Direction::Negative
        } else {
            Direction::Positive
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Domain {
    ttc_min: i64,
    ttc_max: i64,
    buffer_min: i64,
    buffer_max: i64,
    momentum_min: i64,
    momentum_max: i64,
}

#[derive(Clone)]
pub struct ProbabilityTable {
    conn: Arc<Mutex<Connection>>,
    domain: Domain,
}

impl ProbabilityTable {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open probability table {db_path}"))?;
        let domain = Self::load_domain(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            domain,
        })
    }

    /// Empty in-memory table for tests; populate with `insert_row` and seal
    /// with `reload_domain`.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory probability table")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS prob_lookup (
                ttc_seconds INTEGER NOT NULL,
                buffer_points INTEGER NOT NULL,
                momentum_bucket INTEGER NOT NULL,
                prob_within_positive REAL NOT NULL,
                prob_within_negative REAL NOT NULL,
                PRIMARY KEY (ttc_seconds, buffer_points, momentum_bucket)
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            domain: Domain {
                ttc_min: 0,
                ttc_max: 0,
                buffer_min: 0,
                buffer_max: 0,
                momentum_min: 0,
                momentum_max: 0,
            },
        })
    }

    fn load_domain(conn: &Connection) -> Result<Domain> {
        let row: Option<(i64, i64, i64, i64, i64, i64)> = conn
            .query_row(
                "SELECT MIN(ttc_seconds), MAX(ttc_seconds), MIN(buffer_points), \
                 MAX(buffer_points), MIN(momentum_bucket), MAX(momentum_bucket) FROM prob_lookup",
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                    ))
                },
            )
            .optional()
            .context("read probability table domain")?;
        let Some((ttc_min, ttc_max, buffer_min, buffer_max, momentum_min, momentum_max)) = row
        else {
            return Err(anyhow!("probability table is empty"));
        };
        if ttc_max == 0 && buffer_max == 0 {
            return Err(anyhow!("probability table is empty"));
        }
        Ok(Domain {
            ttc_min,
            ttc_max,
            buffer_min,
            buffer_max,
            momentum_min,
            momentum_max,
        })
    }

    /// Test-only row insertion; the production table is generated offline.
    pub async fn insert_row(
        &self,
        ttc_seconds: i64,
        buffer_points: i64,
        momentum_bucket: i64,
        prob_within_positive: f64,
        prob_within_negative: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO prob_lookup \
             (ttc_seconds, buffer_points, momentum_bucket, prob_within_positive, prob_within_negative) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ttc_seconds,
                buffer_points,
                momentum_bucket,
                prob_within_positive,
                prob_within_negative
            ],
        )?;
        Ok(())
    }

    pub async fn reload_domain(&mut self) -> Result<()> {
        let domain = {
            let conn = self.conn.lock().await;
            Self::load_domain(&conn)?
        };
        self.domain = domain;
        Ok(())
    }

    fn round_to_step(value: f64, step: i64) -> i64 {
        ((value / step as f64).round() as i64) * step
    }

    fn clamp(value: i64, lo: i64, hi: i64) -> i64 {
        value.max(lo).min(hi)
    }

    fn momentum_bucket(&self, momentum: f64) -> i64 {
        let bucket = momentum.round() as i64;
        let bucket = Self::clamp(bucket, -MOMENTUM_CLAMP, MOMENTUM_CLAMP);
        Self::clamp(bucket, self.domain.momentum_min, self.domain.momentum_max)
    }

    async fn point(&self, ttc_key: i64, buffer_key: i64, bucket: i64) -> Result<Option<(f64, f64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT prob_within_positive, prob_within_negative FROM prob_lookup \
             WHERE ttc_seconds = ?1 AND buffer_points = ?2 AND momentum_bucket = ?3",
        )?;
        let row = stmt
            .query_row(params![ttc_key, buffer_key, bucket], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        Ok(row)
    }

    /// Probability (0-100) that the price move stays within `buffer` points
    /// in `direction` over the remaining `ttc_seconds`.
    pub async fn prob_within(
        &self,
        ttc_seconds: f64,
        buffer: f64,
        momentum: f64,
        direction: Direction,
    ) -> Result<Option<f64>> {
        let bucket = self.momentum_bucket(momentum);
        let ttc_key = Self::clamp(
            Self::round_to_step(ttc_seconds, TTC_STEP),
            self.domain.ttc_min,
            self.domain.ttc_max,
        );

        let pick = |pair: (f64, f64)| match direction {
            Direction::Positive => pair.0,
            Direction::Negative => pair.1,
        };

        let buffer = buffer.abs();
        let quarter_step = BUFFER_STEP as f64 / 4.0;
        if buffer < quarter_step {
            // Linear ramp: 100% at zero buffer down to the first-step value.
            let first_key = Self::clamp(
                BUFFER_STEP.max(self.domain.buffer_min),
                self.domain.buffer_min,
                self.domain.buffer_max,
            );
            let Some(pair) = self.point(ttc_key, first_key, bucket).await? else {
                return Ok(None);
            };
            let at_step = pick(pair);
            let ramped = 100.0 + (at_step - 100.0) * (buffer / BUFFER_STEP as f64);
            return Ok(Some(ramped));
        }

        let buffer_key = Self::clamp(
            Self::round_to_step(buffer, BUFFER_STEP),
            self.domain.buffer_min,
            self.domain.buffer_max,
        );
        Ok(self.point(ttc_key, buffer_key, bucket).await?.map(pick))
    }

    /// Probability (0-100) that a strike is not crossed before expiry; the
    /// direction follows the strike's side of the money line.
    pub async fn prob_for_strike(
        &self,
        strike: f64,
        price: f64,
        ttc_seconds: f64,
        momentum: f64,
    ) -> Result<Option<f64>> {
        let direction = Direction::for_strike(strike, price);
        let buffer = (price - strike).abs();
        self.prob_within(ttc_seconds, buffer, momentum, direction).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_table() -> ProbabilityTable {
        let mut table = ProbabilityTable::open_in_memory().unwrap();
        // Small grid: ttc {5..600}, buffer {10..100}, momentum {-1, 0, 1}.
        for ttc in (5..=600).step_by(5) {
            for buffer in (10..=100).step_by(10) {
                for bucket in -1..=1 {
                    let pos = 50.0 + buffer as f64 / 4.0 + bucket as f64;
                    let neg = 50.0 + buffer as f64 / 4.0 - bucket as f64;
                    table
                        .insert_row(ttc as i64, buffer as i64, bucket, pos, neg)
                        .await
                        .unwrap();
                }
            }
        }
        table.reload_domain().await.unwrap();
        table
    }

    #[tokio::test]
    async fn keys_round_to_nearest_step() {
        let table = seeded_table().await;
        // ttc 598 -> 600, buffer 47 -> 50, momentum 0.4 -> 0.
        let p = table
            .prob_within(598.0, 47.0, 0.4, Direction::Positive)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p, 50.0 + 50.0 / 4.0);
    }

    #[tokio::test]
    async fn inputs_clamp_to_domain() {
        let table = seeded_table().await;
        let inside = table
            .prob_within(600.0, 100.0, 1.0, Direction::Positive)
            .await
            .unwrap()
            .unwrap();
        let outside = table
            .prob_within(10_000.0, 500.0, 99.0, Direction::Positive)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inside, outside);
    }

    #[tokio::test]
    async fn sub_quarter_step_uses_linear_ramp() {
        let table = seeded_table().await;
        let at_step = table
            .prob_within(300.0, 10.0, 0.0, Direction::Negative)
            .await
            .unwrap()
            .unwrap();

        let at_zero = table
            .prob_within(300.0, 0.0, 0.0, Direction::Negative)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(at_zero, 100.0);

        let mid = table
            .prob_within(300.0, 2.0, 0.0, Direction::Negative)
            .await
            .unwrap()
            .unwrap();
        let expected = 100.0 + (at_step - 100.0) * 0.2;
        assert!((mid - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn strike_side_selects_direction() {
        let table = seeded_table().await;
        // Strike below price: downside move matters.
        let below = table
            .prob_for_strike(118_950.0, 119_000.0, 300.0, 1.0)
            .await
            .unwrap()
            .unwrap();
        let above = table
            .prob_for_strike(119_050.0, 119_000.0, 300.0, 1.0)
            .await
            .unwrap()
            .unwrap();
        // Seeded grid makes positive and negative differ by 2*bucket.
        assert!((above - below - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_table_fails_open() {
        let table = ProbabilityTable::open_in_memory().unwrap();
        let mut table2 = table.clone();
        assert!(table2.reload_domain().await.is_err());
    }
}
