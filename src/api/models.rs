use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::chain::RemoteTotals;
use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::saga::{IngestOutcome, Ingested};

// ========== UNIT HELPERS ==========

/// Render a base-unit integer as a decimal string, e.g. `102_000000` at 6 decimals -> `"102.000000"`
pub fn format_units(value: u128, decimals: u32) -> String {
    if decimals == 0 {
        return value.to_string();
    }
    let digits = format!("{:0>width$}", value, width = decimals as usize + 1);
    let (whole, fraction) = digits.split_at(digits.len() - decimals as usize);
    format!("{whole}.{fraction}")
}

/// Parse a non-negative decimal string into base units. More fractional digits
/// than `decimals` is an error rather than a silent truncation.
pub fn parse_units(raw: &str, decimals: u32) -> AppResult<u128> {
    let raw = raw.trim();
    let invalid = || AppError::InvalidInput(format!("invalid amount: {raw:?}"));

    let (whole, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    if fraction.len() > decimals as usize {
        return Err(AppError::InvalidInput(format!(
            "amount {raw} has more than {decimals} decimal places"
        )));
    }

    let scale = 10u128.checked_pow(decimals).ok_or_else(invalid)?;
    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
    let fraction: u128 = if fraction.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", fraction, width = decimals as usize);
        padded.parse().map_err(|_| invalid())?
    };

    whole
        .checked_mul(scale)
        .and_then(|v| v.checked_add(fraction))
        .ok_or_else(invalid)
}

/// Token decimals used when rendering amounts
#[derive(Debug, Clone, Copy)]
pub struct Units {
    /// Origin asset and origin vault shares
    pub asset: u32,
    /// Settlement currency and remote shares
    pub settlement: u32,
}

// ========== REQUEST MODELS ==========

/// Operator-triggered deposit. Identified by its origin log when `tx_hash` and
/// `log_index` are given, otherwise by `reference`.
#[derive(Debug, Deserialize, Validate)]
pub struct ManualDepositRequest {
    #[validate(length(equal = 42, message = "must be a 0x-prefixed 20-byte address"))]
    pub user: String,
    #[validate(length(min = 1, max = 48, message = "must be a decimal amount"))]
    pub amount: String,
    #[validate(length(equal = 66, message = "must be a 0x-prefixed 32-byte hash"))]
    pub tx_hash: Option<String>,
    pub log_index: Option<u64>,
    #[validate(length(min = 1, max = 128))]
    pub reference: Option<String>,
}

/// Operator-triggered withdrawal of `shares` origin vault shares
#[derive(Debug, Deserialize, Validate)]
pub struct ManualWithdrawRequest {
    #[validate(length(equal = 42, message = "must be a 0x-prefixed 20-byte address"))]
    pub user: String,
    #[validate(length(min = 1, max = 48, message = "must be a decimal amount"))]
    pub shares: String,
    #[validate(length(equal = 66, message = "must be a 0x-prefixed 32-byte hash"))]
    pub tx_hash: Option<String>,
    pub log_index: Option<u64>,
    #[validate(length(min = 1, max = 128))]
    pub reference: Option<String>,
}

/// `(tx_hash, log_index)` when both are present; one without the other is rejected
pub fn origin_log(tx_hash: Option<String>, log_index: Option<u64>) -> AppResult<Option<(String, u64)>> {
    match (tx_hash, log_index) {
        (Some(tx_hash), Some(log_index)) => Ok(Some((tx_hash, log_index))),
        (None, None) => Ok(None),
        _ => Err(AppError::InvalidInput(
            "tx_hash and log_index must be given together".into(),
        )),
    }
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub origin_vault: String,
    pub remote_manager: String,
    pub remote_operator: String,
    pub origin_operator: String,
    pub last_processed_block: Option<u64>,
    pub failed_terminal: u64,
    pub confirmation_unknown: u64,
    pub stale_sagas: u64,
    pub queued_sagas: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub address: String,
    pub vault_balance: String,
    pub principal: String,
    pub remote_shares: String,
    /// Shares the remote manager reports for the user
    pub onchain_shares: String,
    pub yield_earned: String,
    pub state: PositionState,
}

#[derive(Debug, Serialize)]
pub struct PositionResponse {
    pub address: String,
    pub principal: String,
    pub remote_shares: String,
    pub state: PositionState,
    pub updated_at: DateTime<Utc>,
}

impl PositionResponse {
    pub fn new(position: &UserPosition, units: Units) -> Self {
        Self {
            address: position.address.clone(),
            principal: format_units(position.principal, units.settlement),
            remote_shares: format_units(position.remote_shares, units.settlement),
            state: position.state,
            updated_at: position.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub position: PositionResponse,
    pub recent_sagas: Vec<SagaResponse>,
}

#[derive(Debug, Serialize)]
pub struct GlobalResponse {
    pub total_principal: String,
    pub total_shares: String,
    pub active_users: u64,
    pub withdrawing_users: u64,
    pub remote_total_supplied: String,
    pub remote_total_assets: String,
}

impl GlobalResponse {
    pub fn new(ledger: &LedgerTotals, remote: &RemoteTotals, units: Units) -> Self {
        Self {
            total_principal: format_units(ledger.total_principal, units.settlement),
            total_shares: format_units(ledger.total_shares, units.settlement),
            active_users: ledger.active_users,
            withdrawing_users: ledger.withdrawing_users,
            remote_total_supplied: format_units(remote.total_supplied, units.settlement),
            remote_total_assets: format_units(remote.total_assets, units.settlement),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub sagas: Vec<SagaCount>,
    pub realized_yield: String,
    pub stale_sagas: u64,
    pub total_supplied: String,
    pub total_assets: String,
    pub total_yield: String,
}

/// Saga record with amounts rendered in token units
#[derive(Debug, Serialize)]
pub struct SagaResponse {
    pub id: String,
    pub kind: SagaKind,
    pub address: String,
    pub step: SagaStep,
    pub status: SagaStatus,
    pub input_amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converted_amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares_amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets_returned: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yield_amount: Option<String>,
    pub rate: Option<String>,
    pub rate_source: Option<RateSource>,
    pub yield_status: YieldLeg,
    pub pending_tx: Option<String>,
    pub yield_tx: Option<String>,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub origin_tx: Option<String>,
    pub origin_log_index: Option<u64>,
    pub trigger: SagaTrigger,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaResponse {
    pub fn new(saga: &SagaRecord, units: Units) -> Self {
        let settlement = |v: Option<u128>| v.map(|v| format_units(v, units.settlement));
        Self {
            id: saga.id.clone(),
            kind: saga.kind,
            address: saga.address.clone(),
            step: saga.step,
            status: saga.status,
            input_amount: format_units(saga.input_amount, units.asset),
            converted_amount: settlement(saga.converted_amount),
            principal_amount: settlement(saga.principal_amount),
            shares_amount: settlement(saga.shares_amount),
            assets_returned: settlement(saga.assets_returned),
            yield_amount: settlement(saga.yield_amount),
            rate: saga.rate.map(|r| r.to_string()),
            rate_source: saga.rate_source,
            yield_status: saga.yield_status,
            pending_tx: saga.pending_tx.clone(),
            yield_tx: saga.yield_tx.clone(),
            attempt: saga.attempt,
            last_error: saga.last_error.clone(),
            next_attempt_at: saga.next_attempt_at,
            origin_tx: saga.origin_tx.clone(),
            origin_log_index: saga.origin_log_index,
            trigger: saga.trigger,
            created_at: saga.created_at,
            updated_at: saga.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SagaDetailResponse {
    pub saga: SagaResponse,
    pub audit: Vec<AuditEntry>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub outcome: IngestOutcome,
    pub saga: SagaResponse,
}

impl IngestResponse {
    pub fn new(ingested: &Ingested, units: Units) -> Self {
        Self {
            outcome: ingested.outcome,
            saga: SagaResponse::new(&ingested.saga, units),
        }
    }
}
