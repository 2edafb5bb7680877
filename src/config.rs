use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Flare contract registry, same address on every Flare network.
pub const FLARE_CONTRACT_REGISTRY: &str = "0xaD67FE66660Fb8dFE9d6b1b4240d8650e30F6019";

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OracleKind {
    Ftso,
    Pyth,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_address: String,

    // Origin chain
    pub origin_rpc_url: String,
    pub origin_vault_address: String,
    pub origin_operator_key: String,
    pub origin_start_block: u64,
    pub confirmation_depth: u64,
    pub watcher_poll_interval_secs: u64,
    pub watcher_batch_size: u64,

    // Remote chain
    pub remote_rpc_url: String,
    pub remote_manager_address: String,
    pub remote_operator_key: String,
    pub remote_confirmations: u64,
    pub tx_timeout_secs: u64,
    pub tx_poll_interval_ms: u64,

    // Price feed
    pub oracle_kind: OracleKind,
    pub oracle_rpc_url: Option<String>,
    pub ftso_registry_address: String,
    pub oracle_symbol: String,
    pub pyth_base_url: String,
    pub quote_max_age_secs: u64,
    pub reject_stale_quotes: bool,
    pub fallback_rate: Option<String>,

    pub asset_decimals: u32,
    pub settlement_decimals: u32,

    // Saga scheduling
    pub max_workers: usize,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub sweep_interval_secs: u64,
    pub stale_saga_secs: u64,

    // Operator surface
    pub operator_token: Option<String>,
    pub manual_rate_limit_per_minute: u32,
    /// Comma-separated CORS origins; unset allows any origin
    pub cors_allowed_origins: Option<String>,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        let settings = config::Config::builder()
            .set_default("database_max_connections", 10)?
            .set_default("bind_address", "0.0.0.0:3000")?
            .set_default("origin_start_block", 0)?
            .set_default("confirmation_depth", 3)?
            .set_default("watcher_poll_interval_secs", 6)?
            .set_default("watcher_batch_size", 500)?
            .set_default("remote_confirmations", 1)?
            .set_default("tx_timeout_secs", 120)?
            .set_default("tx_poll_interval_ms", 2000)?
            .set_default("oracle_kind", "ftso")?
            .set_default("ftso_registry_address", FLARE_CONTRACT_REGISTRY)?
            .set_default("oracle_symbol", "XRP")?
            .set_default("pyth_base_url", "https://hermes.pyth.network")?
            .set_default("quote_max_age_secs", 300)?
            .set_default("reject_stale_quotes", true)?
            .set_default("asset_decimals", 6)?
            .set_default("settlement_decimals", 6)?
            .set_default("max_workers", 8)?
            .set_default("max_attempts", 8)?
            .set_default("retry_base_ms", 1000)?
            .set_default("retry_max_ms", 60_000)?
            .set_default("sweep_interval_secs", 15)?
            .set_default("stale_saga_secs", 900)?
            .set_default("manual_rate_limit_per_minute", 30)?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.max_workers == 0 {
            return Err(AppError::Config("max_workers must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(AppError::Config("max_attempts must be at least 1".into()));
        }
        if self.watcher_batch_size == 0 {
            return Err(AppError::Config("watcher_batch_size must be at least 1".into()));
        }
        if self.manual_rate_limit_per_minute == 0 {
            return Err(AppError::Config(
                "manual_rate_limit_per_minute must be at least 1".into(),
            ));
        }
        self.fallback_rate()?;
        self.stale_after()?;
        Ok(())
    }

    /// Age past which an unfinished saga counts as stale
    pub fn stale_after(&self) -> AppResult<chrono::Duration> {
        stale_window(self.stale_saga_secs)
    }

    /// Degraded-mode rate, parsed. Must be strictly positive when set.
    pub fn fallback_rate(&self) -> AppResult<Option<Decimal>> {
        match self.fallback_rate.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => {
                let rate: Decimal = raw
                    .parse()
                    .map_err(|e| AppError::Config(format!("fallback_rate {raw}: {e}")))?;
                if rate <= Decimal::ZERO {
                    return Err(AppError::Config("fallback_rate must be positive".into()));
                }
                Ok(Some(rate))
            }
        }
    }

    pub fn oracle_rpc_url(&self) -> &str {
        self.oracle_rpc_url.as_deref().unwrap_or(&self.origin_rpc_url)
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_secs(self.tx_timeout_secs)
    }

    pub fn tx_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tx_poll_interval_ms)
    }
}

fn stale_window(secs: u64) -> AppResult<chrono::Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| AppError::Config(format!("stale_saga_secs {secs} is out of range")))
}
