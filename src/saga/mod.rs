//! Saga coordinator: drives deposits and withdrawals across the origin vault and
//! the remote manager, persisting every step boundary in the ledger store.

pub mod convert;
pub mod coordinator;
mod deposit;
pub mod lanes;
mod reconcile;
pub mod retry;
mod withdraw;

#[cfg(test)]
pub mod mocks;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::chain::OriginEvent;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::ledger::models::{SagaKind, SagaRecord, SagaStatus, SagaTrigger};
use retry::RetryPolicy;

pub use coordinator::SagaCoordinator;

/// Where an origin-observed saga came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginRef {
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: Option<u64>,
}

/// Input to [`SagaCoordinator::ingest`], from the watcher or an operator
#[derive(Debug, Clone)]
pub struct SagaRequest {
    pub id: String,
    pub kind: SagaKind,
    pub address: String,
    /// Asset amount for deposits, origin vault shares for withdrawals
    pub amount: u128,
    pub trigger: SagaTrigger,
    pub origin: Option<OriginRef>,
}

impl From<&OriginEvent> for SagaRequest {
    fn from(event: &OriginEvent) -> Self {
        Self {
            id: event.saga_id(),
            kind: event.kind,
            address: event.user.clone(),
            amount: event.amount,
            trigger: SagaTrigger::Watcher,
            origin: Some(OriginRef {
                tx_hash: event.tx_hash.clone(),
                log_index: event.log_index,
                block_number: Some(event.block_number),
            }),
        }
    }
}

impl SagaRequest {
    /// Operator-submitted request. Identified by its origin log when given, else by `reference`.
    pub fn manual(
        kind: SagaKind,
        address: String,
        amount: u128,
        origin_log: Option<(String, u64)>,
        reference: Option<String>,
    ) -> AppResult<Self> {
        let (id, origin) = match (origin_log, reference) {
            (Some((tx_hash, log_index)), _) => (
                crate::chain::event_saga_id(&tx_hash, log_index),
                Some(OriginRef {
                    tx_hash: tx_hash.to_lowercase(),
                    log_index,
                    block_number: None,
                }),
            ),
            (None, Some(reference)) if !reference.trim().is_empty() => {
                (format!("manual:{}", reference.trim()), None)
            }
            _ => {
                return Err(AppError::InvalidInput(
                    "either tx_hash with log_index or a reference is required".into(),
                ))
            }
        };

        Ok(Self {
            id,
            kind,
            address,
            amount,
            trigger: SagaTrigger::Manual,
            origin,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// New saga recorded and queued
    Created,
    /// Saga already finished; nothing was done
    Duplicate,
    /// Saga exists and is still in progress; it was (re)queued
    Resumed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ingested {
    pub outcome: IngestOutcome,
    pub saga: SagaRecord,
}

impl Ingested {
    pub fn status(&self) -> SagaStatus {
        self.saga.status
    }
}

/// Tunables the coordinator reads on every step
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub oracle_symbol: String,
    pub asset_decimals: u32,
    pub settlement_decimals: u32,
    pub reject_stale_quotes: bool,
    /// Degraded-mode rate used when the oracle cannot give a usable quote
    pub fallback_rate: Option<Decimal>,
    pub max_workers: usize,
    pub retry: RetryPolicy,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> AppResult<Self> {
        Ok(Self {
            oracle_symbol: config.oracle_symbol.clone(),
            asset_decimals: config.asset_decimals,
            settlement_decimals: config.settlement_decimals,
            reject_stale_quotes: config.reject_stale_quotes,
            fallback_rate: config.fallback_rate()?,
            max_workers: config.max_workers,
            retry: RetryPolicy {
                base_ms: config.retry_base_ms,
                max_ms: config.retry_max_ms,
                max_attempts: config.max_attempts,
            },
        })
    }
}
