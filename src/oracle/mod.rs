pub mod cache;
pub mod ftso;
pub mod pyth;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::OracleError;

pub use ftso::FtsoOracle;
pub use pyth::PythOracle;

/// A single price observation. Not persisted: sagas record the amount they
/// derived from it, never the quote itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceQuote {
    pub symbol: String,
    pub price_usd: Decimal,
    /// Decimals the feed reported the raw price with
    pub decimals: u32,
    pub observed_at: DateTime<Utc>,
    /// Older than the adapter's freshness threshold when fetched
    pub stale: bool,
}

impl PriceQuote {
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.observed_at).num_seconds()
    }
}

/// Read-only price source. Safe to retry and share without locking.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<PriceQuote, OracleError>;

    fn name(&self) -> &'static str;
}

/// Whether an observation taken at `observed_at` is past `max_age_secs`
pub fn is_stale(observed_at: DateTime<Utc>, max_age_secs: u64, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(observed_at).num_seconds() > max_age_secs as i64
}
