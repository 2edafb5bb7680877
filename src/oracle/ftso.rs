use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::sol;
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::cache::QuoteCache;
use super::{is_stale, PriceOracle, PriceQuote};
use crate::error::{AppError, AppResult, OracleError};

sol! {
    #[sol(rpc)]
    interface IFlareContractRegistry {
        function getContractAddressByName(string name) external view returns (address);
    }

    #[sol(rpc)]
    interface IFtsoRegistry {
        function getCurrentPriceWithDecimals(string symbol)
            external
            view
            returns (uint256 price, uint256 timestamp, uint256 decimals);
    }
}

const FTSO_REGISTRY_NAME: &str = "FtsoRegistry";

/// Flare FTSO price feed. The FtsoRegistry address is resolved through the
/// contract registry on first use and cached.
pub struct FtsoOracle {
    provider: DynProvider,
    contract_registry: Address,
    ftso_registry: RwLock<Option<Address>>,
    cache: QuoteCache,
    max_age_secs: u64,
}

impl FtsoOracle {
    pub fn new(rpc_url: &str, contract_registry: &str, max_age_secs: u64) -> AppResult<Self> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| AppError::Config(format!("oracle_rpc_url {rpc_url}: {e}")))?;
        let contract_registry = contract_registry
            .parse::<Address>()
            .map_err(|e| AppError::Config(format!("ftso_registry_address: {e}")))?;

        Ok(Self {
            provider: ProviderBuilder::new().connect_http(url).erased(),
            contract_registry,
            ftso_registry: RwLock::new(None),
            cache: QuoteCache::new(5_000),
            max_age_secs,
        })
    }

    async fn ftso_registry(&self) -> Result<Address, OracleError> {
        if let Some(address) = *self.ftso_registry.read() {
            return Ok(address);
        }

        let registry = IFlareContractRegistry::new(self.contract_registry, self.provider.clone());
        let address = registry
            .getContractAddressByName(FTSO_REGISTRY_NAME.to_string())
            .call()
            .await
            .map_err(|e| OracleError::Unavailable(format!("registry lookup: {e}")))?;

        if address == Address::ZERO {
            return Err(OracleError::Unavailable(
                "FtsoRegistry not registered".to_string(),
            ));
        }

        info!("✅ FTSO registry resolved at {}", address);
        *self.ftso_registry.write() = Some(address);
        Ok(address)
    }
}

#[async_trait]
impl PriceOracle for FtsoOracle {
    async fn quote(&self, symbol: &str) -> Result<PriceQuote, OracleError> {
        if let Some(quote) = self.cache.get(symbol) {
            return Ok(quote);
        }

        let registry = IFtsoRegistry::new(self.ftso_registry().await?, self.provider.clone());
        let result = registry
            .getCurrentPriceWithDecimals(symbol.to_string())
            .call()
            .await
            .map_err(|e| OracleError::Unavailable(format!("{symbol}: {e}")))?;

        let quote = ftso_quote(
            symbol,
            result.price,
            result.timestamp,
            result.decimals,
            self.max_age_secs,
            Utc::now(),
        )?;

        if quote.stale {
            warn!(
                "⚠️  Stale FTSO price for {}: {} (age {}s)",
                symbol,
                quote.price_usd,
                quote.age_secs(Utc::now())
            );
        }

        self.cache.insert(&quote);
        Ok(quote)
    }

    fn name(&self) -> &'static str {
        "ftso"
    }
}

/// Turn the registry's raw `(price, timestamp, decimals)` triple into a quote
fn ftso_quote(
    symbol: &str,
    price: U256,
    timestamp: U256,
    decimals: U256,
    max_age_secs: u64,
    now: DateTime<Utc>,
) -> Result<PriceQuote, OracleError> {
    let invalid = |reason: String| OracleError::InvalidPrice {
        symbol: symbol.to_string(),
        reason,
    };

    let price: i128 = i128::try_from(price).map_err(|_| invalid("price out of range".into()))?;
    let decimals: u32 = u32::try_from(decimals).map_err(|_| invalid("decimals out of range".into()))?;
    let timestamp: i64 =
        i64::try_from(timestamp).map_err(|_| invalid("timestamp out of range".into()))?;

    if price <= 0 {
        return Err(invalid(format!("non-positive price {price}")));
    }

    let price_usd = Decimal::try_from_i128_with_scale(price, decimals)
        .map_err(|e| invalid(e.to_string()))?;
    let observed_at = DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| invalid(format!("bad timestamp {timestamp}")))?;

    Ok(PriceQuote {
        symbol: symbol.to_string(),
        price_usd,
        decimals,
        observed_at,
        stale: is_stale(observed_at, max_age_secs, now),
    })
}
