use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use super::cache::QuoteCache;
use super::{is_stale, PriceOracle, PriceQuote};
use crate::error::OracleError;

/// Response from Pyth Hermes `latest_price_feeds`
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PythPriceResponse {
    pub id: String,
    pub price: PythPrice,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PythPrice {
    #[serde(rename = "price")]
    pub price: String,
    #[serde(rename = "conf")]
    pub confidence: String,
    #[serde(rename = "expo")]
    pub exponent: i32,
    #[serde(rename = "publish_time")]
    pub publish_time: i64,
}

impl PythPrice {
    /// Convert Pyth price to decimal (handle exponent)
    pub fn to_decimal(&self) -> Result<Decimal, String> {
        let mantissa = i128::from_str(&self.price).map_err(|e| format!("price {}: {e}", self.price))?;

        if self.exponent <= 0 {
            Decimal::try_from_i128_with_scale(mantissa, self.exponent.unsigned_abs())
                .map_err(|e| e.to_string())
        } else {
            let factor = 10i64
                .checked_pow(self.exponent.unsigned_abs())
                .ok_or_else(|| format!("exponent {} out of range", self.exponent))?;
            Decimal::try_from_i128_with_scale(mantissa, 0)
                .map_err(|e| e.to_string())?
                .checked_mul(Decimal::from(factor))
                .ok_or_else(|| "price overflow".to_string())
        }
    }

    pub fn publish_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.publish_time, 0)
    }
}

/// Pyth Hermes HTTP price feed. `symbol` is the hex feed id.
pub struct PythOracle {
    client: Client,
    base_url: String,
    cache: QuoteCache,
    max_age_secs: u64,
}

impl PythOracle {
    pub fn new(base_url: &str, max_age_secs: u64) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: QuoteCache::new(5_000),
            max_age_secs,
        }
    }

    async fn fetch_price(&self, feed_id: &str) -> Result<PythPrice, OracleError> {
        let url = format!("{}/api/latest_price_feeds?ids[]={}", self.base_url, feed_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| OracleError::Unavailable(format!("pyth {feed_id}: {e}")))?;

        let feeds: Vec<PythPriceResponse> = response
            .json()
            .await
            .map_err(|e| OracleError::Unavailable(format!("pyth {feed_id}: {e}")))?;

        feeds
            .into_iter()
            .next()
            .map(|feed| feed.price)
            .ok_or_else(|| OracleError::UnknownSymbol(feed_id.to_string()))
    }
}

#[async_trait]
impl PriceOracle for PythOracle {
    async fn quote(&self, symbol: &str) -> Result<PriceQuote, OracleError> {
        if let Some(quote) = self.cache.get(symbol) {
            return Ok(quote);
        }

        let price = self.fetch_price(symbol).await?;
        let quote = pyth_quote(symbol, &price, self.max_age_secs, Utc::now())?;

        if quote.stale {
            warn!(
                "⚠️  Stale Pyth price for {}: {} (published {})",
                symbol, quote.price_usd, quote.observed_at
            );
        } else {
            info!("✓ Fetched Pyth price: {} = {} USD", symbol, quote.price_usd);
        }

        self.cache.insert(&quote);
        Ok(quote)
    }

    fn name(&self) -> &'static str {
        "pyth"
    }
}

fn pyth_quote(
    symbol: &str,
    price: &PythPrice,
    max_age_secs: u64,
    now: DateTime<Utc>,
) -> Result<PriceQuote, OracleError> {
    let invalid = |reason: String| OracleError::InvalidPrice {
        symbol: symbol.to_string(),
        reason,
    };

    let price_usd = price.to_decimal().map_err(invalid)?;
    if price_usd <= Decimal::ZERO {
        return Err(invalid(format!("non-positive price {price_usd}")));
    }
    let observed_at = price
        .publish_time()
        .ok_or_else(|| invalid(format!("bad publish_time {}", price.publish_time)))?;

    Ok(PriceQuote {
        symbol: symbol.to_string(),
        price_usd,
        decimals: price.exponent.min(0).unsigned_abs(),
        observed_at,
        stale: is_stale(observed_at, max_age_secs, now),
    })
}
