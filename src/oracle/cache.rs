use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::PriceQuote;

/// Cached quote with the time it was fetched
#[derive(Debug, Clone)]
struct CachedQuote {
    quote: PriceQuote,
    fetched_at: DateTime<Utc>,
}

/// Short-lived quote cache keyed by symbol. Keeps bursts of sagas from
/// hammering the feed; staleness is still judged on the feed's own timestamp.
#[derive(Clone)]
pub struct QuoteCache {
    cache: Arc<RwLock<HashMap<String, CachedQuote>>>,
    ttl_ms: i64,
}

impl QuoteCache {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl_ms,
        }
    }

    pub fn get(&self, symbol: &str) -> Option<PriceQuote> {
        let cache = self.cache.read();
        let entry = cache.get(symbol)?;
        let age = Utc::now().signed_duration_since(entry.fetched_at);
        if age.num_milliseconds() < self.ttl_ms {
            debug!("✓ Quote cache hit: {} (age: {}ms)", symbol, age.num_milliseconds());
            Some(entry.quote.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, quote: &PriceQuote) {
        self.cache.write().insert(
            quote.symbol.clone(),
            CachedQuote {
                quote: quote.clone(),
                fetched_at: Utc::now(),
            },
        );
    }
}
