use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::models::*;
use crate::{
    chain::{normalize_address, OriginVault, RemoteLedger},
    error::{AppError, AppResult},
    ledger::{
        models::{SagaKind, SagaStatus, UserPosition},
        LedgerStore,
    },
    middleware::{RateLimitLayer, ValidatedJson},
    saga::{IngestOutcome, SagaCoordinator, SagaRequest},
};

/// Sagas listed on `/user/:address`
const RECENT_SAGAS: i64 = 20;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub coordinator: Arc<SagaCoordinator>,
    pub remote: Arc<dyn RemoteLedger>,
    pub origin: Arc<dyn OriginVault>,
    /// Watcher cursor reported as `last_processed_block`
    pub cursor_stream: String,
    pub stale_after: chrono::Duration,
    pub started_at: Instant,
    pub operator_token: Option<String>,
    pub manual_limiter: RateLimitLayer,
}

impl AppState {
    fn units(&self) -> Units {
        let settings = self.coordinator.settings();
        Units {
            asset: settings.asset_decimals,
            settlement: settings.settlement_decimals,
        }
    }

    fn stale_cutoff(&self) -> DateTime<Utc> {
        Utc::now()
            .checked_sub_signed(self.stale_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

fn checksum(address: &str) -> AppResult<String> {
    normalize_address(address).map_err(|_| AppError::InvalidAddress(address.to_string()))
}

/// Health check with operator-facing counts
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let stats = state
        .ledger
        .saga_stats(state.stale_cutoff())
        .await?;
    let last_processed_block = state.ledger.get_cursor(&state.cursor_stream).await?;

    let failed_terminal = stats.count_status(SagaStatus::FailedTerminal);
    let confirmation_unknown = stats.count_status(SagaStatus::ConfirmationUnknown);
    let degraded = failed_terminal > 0 || confirmation_unknown > 0 || stats.stale > 0;

    Ok(Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        origin_vault: state.origin.vault_address(),
        remote_manager: state.remote.manager_address(),
        remote_operator: state.remote.operator_address(),
        origin_operator: state.origin.operator_address(),
        last_processed_block,
        failed_terminal,
        confirmation_unknown,
        stale_sagas: stats.stale,
        queued_sagas: state.coordinator.queued(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

/// Ledger position joined with live vault balance and remote yield
/// GET /balance/:address
pub async fn get_balance(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> AppResult<Json<BalanceResponse>> {
    let address = checksum(&address)?;
    let units = state.units();

    let position = state
        .ledger
        .get_position(&address)
        .await?
        .unwrap_or_else(|| UserPosition::empty(&address));
    let (vault_balance, yield_earned, onchain_shares) = tokio::try_join!(
        state.origin.user_balance(&address),
        state.remote.user_yield(&address),
        state.remote.user_shares(&address),
    )?;

    Ok(Json(BalanceResponse {
        address,
        vault_balance: format_units(vault_balance, units.asset),
        principal: format_units(position.principal, units.settlement),
        remote_shares: format_units(position.remote_shares, units.settlement),
        onchain_shares: format_units(onchain_shares, units.settlement),
        yield_earned: format_units(yield_earned, units.settlement),
        state: position.state,
    }))
}

/// GET /user/:address
pub async fn get_user(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> AppResult<Json<UserResponse>> {
    let address = checksum(&address)?;
    let units = state.units();

    let position = state
        .ledger
        .get_position(&address)
        .await?
        .unwrap_or_else(|| UserPosition::empty(&address));
    let sagas = state.ledger.list_user_sagas(&address, RECENT_SAGAS).await?;

    Ok(Json(UserResponse {
        position: PositionResponse::new(&position, units),
        recent_sagas: sagas.iter().map(|s| SagaResponse::new(s, units)).collect(),
    }))
}

/// GET /global
pub async fn get_global(State(state): State<AppState>) -> AppResult<Json<GlobalResponse>> {
    let ledger = state.ledger.ledger_totals().await?;
    let remote = state.remote.totals().await?;
    Ok(Json(GlobalResponse::new(&ledger, &remote, state.units())))
}

/// GET /stats
pub async fn get_stats(State(state): State<AppState>) -> AppResult<Json<StatsResponse>> {
    let units = state.units();
    let stats = state
        .ledger
        .saga_stats(state.stale_cutoff())
        .await?;
    let remote = state.remote.totals().await?;

    let mut sagas = stats.counts.clone();
    sagas.sort_by_key(|c| (c.kind.as_str(), c.status.as_str()));

    Ok(Json(StatsResponse {
        sagas,
        realized_yield: format_units(stats.realized_yield, units.settlement),
        stale_sagas: stats.stale,
        total_supplied: format_units(remote.total_supplied, units.settlement),
        total_assets: format_units(remote.total_assets, units.settlement),
        total_yield: format_units(remote.total_yield(), units.settlement),
    }))
}

/// Saga record with its audit trail
/// GET /saga/:id
pub async fn get_saga(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<SagaDetailResponse>> {
    let saga = state
        .ledger
        .get_saga(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("saga {id}")))?;
    let audit = state.ledger.list_audit(&id).await?;

    Ok(Json(SagaDetailResponse {
        saga: SagaResponse::new(&saga, state.units()),
        audit,
    }))
}

/// Operator deposit through the same ingestion path as the watcher
/// POST /manual/deposit
pub async fn manual_deposit(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<ManualDepositRequest>,
) -> AppResult<(StatusCode, Json<IngestResponse>)> {
    let units = state.units();
    let amount = parse_units(&request.amount, units.asset)?;
    let saga_request = SagaRequest::manual(
        SagaKind::Deposit,
        request.user,
        amount,
        origin_log(request.tx_hash, request.log_index)?,
        request.reference,
    )?;

    info!("🛠️  Manual deposit {} for {}", saga_request.id, saga_request.address);
    ingest(&state, saga_request).await
}

/// POST /manual/withdraw
pub async fn manual_withdraw(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<ManualWithdrawRequest>,
) -> AppResult<(StatusCode, Json<IngestResponse>)> {
    let units = state.units();
    let shares = parse_units(&request.shares, units.asset)?;
    let saga_request = SagaRequest::manual(
        SagaKind::Withdraw,
        request.user,
        shares,
        origin_log(request.tx_hash, request.log_index)?,
        request.reference,
    )?;

    info!("🛠️  Manual withdrawal {} for {}", saga_request.id, saga_request.address);
    ingest(&state, saga_request).await
}

async fn ingest(
    state: &AppState,
    request: SagaRequest,
) -> AppResult<(StatusCode, Json<IngestResponse>)> {
    let ingested = state.coordinator.ingest(request).await?;
    let status = match ingested.outcome {
        IngestOutcome::Created => StatusCode::ACCEPTED,
        IngestOutcome::Duplicate | IngestOutcome::Resumed => StatusCode::OK,
    };
    Ok((status, Json(IngestResponse::new(&ingested, state.units()))))
}

/// POST /manual/retry/:id
pub async fn manual_retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<SagaResponse>> {
    let saga = state.coordinator.retry(&id).await?;
    Ok(Json(SagaResponse::new(&saga, state.units())))
}

/// POST /manual/abandon/:id
pub async fn manual_abandon(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<SagaResponse>> {
    let saga = state.coordinator.abandon(&id).await?;
    Ok(Json(SagaResponse::new(&saga, state.units())))
}
