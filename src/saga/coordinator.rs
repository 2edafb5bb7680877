use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use super::lanes::Lanes;
use super::{CoordinatorSettings, IngestOutcome, Ingested, SagaRequest};
use crate::chain::{normalize_address, OriginVault, RemoteLedger};
use crate::error::{AppError, AppResult, Disposition, SagaError};
use crate::ledger::models::{
    PositionEffect, SagaKind, SagaRecord, SagaStatus, SagaStep, UserPosition,
};
use crate::ledger::LedgerStore;
use crate::oracle::PriceOracle;

/// Statuses a saga can sit in while it still needs automatic work
const RUNNABLE: [SagaStatus; 4] = [
    SagaStatus::Pending,
    SagaStatus::StepConfirmed,
    SagaStatus::FailedRetryable,
    SagaStatus::ConfirmationUnknown,
];

/// Owns every saga transition. The watcher and the manual API both enter through
/// [`SagaCoordinator::ingest`]; nothing else writes positions.
pub struct SagaCoordinator {
    pub(super) ledger: Arc<dyn LedgerStore>,
    pub(super) oracle: Arc<dyn PriceOracle>,
    pub(super) remote: Arc<dyn RemoteLedger>,
    pub(super) origin: Arc<dyn OriginVault>,
    pub(super) settings: CoordinatorSettings,
    lanes: Lanes,
    workers: Semaphore,
}

impl SagaCoordinator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        oracle: Arc<dyn PriceOracle>,
        remote: Arc<dyn RemoteLedger>,
        origin: Arc<dyn OriginVault>,
        settings: CoordinatorSettings,
    ) -> Arc<Self> {
        let workers = Semaphore::new(settings.max_workers.max(1));
        Arc::new(Self {
            ledger,
            oracle,
            remote,
            origin,
            settings,
            lanes: Lanes::new(),
            workers,
        })
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Sagas waiting in (or at the head of) a user lane
    pub fn queued(&self) -> usize {
        self.lanes.depth()
    }

    /// Record and queue a saga. Re-delivery of a known id never creates a second saga:
    /// a finished one is acknowledged as a duplicate, an unfinished one is requeued.
    #[instrument(skip(self, request), fields(saga_id = %request.id, kind = %request.kind))]
    pub async fn ingest(self: &Arc<Self>, request: SagaRequest) -> AppResult<Ingested> {
        let address = normalize_address(&request.address)
            .map_err(|_| AppError::InvalidAddress(request.address.clone()))?;
        if request.amount == 0 {
            return Err(AppError::InvalidInput("amount must be greater than zero".into()));
        }

        let mut saga = SagaRecord::new(
            request.id.clone(),
            request.kind,
            address,
            request.amount,
            request.trigger,
        );
        if let Some(origin) = &request.origin {
            saga.origin_tx = Some(origin.tx_hash.clone());
            saga.origin_log_index = Some(origin.log_index);
            saga.origin_block = origin.block_number;
        }

        if self.ledger.insert_saga(&saga).await? {
            info!(
                "📥 New {} saga {} for {} (amount {})",
                saga.kind, saga.id, saga.address, saga.input_amount
            );
            self.audit(
                &saga.id,
                "RECEIVED",
                json!({
                    "kind": saga.kind,
                    "amount": saga.input_amount.to_string(),
                    "trigger": saga.trigger,
                }),
            )
            .await;
            self.enqueue(&saga);
            return Ok(Ingested {
                outcome: IngestOutcome::Created,
                saga,
            });
        }

        let existing = self
            .ledger
            .get_saga(&saga.id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("saga {} vanished after insert", saga.id)))?;

        if existing.kind != saga.kind
            || existing.address != saga.address
            || existing.input_amount != saga.input_amount
        {
            return Err(AppError::Conflict(format!(
                "saga {} already exists with different parameters",
                saga.id
            )));
        }

        if existing.status.is_final() {
            info!("🔁 Duplicate delivery for saga {} ({}), ignoring", existing.id, existing.status);
            return Ok(Ingested {
                outcome: IngestOutcome::Duplicate,
                saga: existing,
            });
        }

        debug!("Saga {} already in progress at {}, requeueing", existing.id, existing.step);
        self.enqueue(&existing);
        Ok(Ingested {
            outcome: IngestOutcome::Resumed,
            saga: existing,
        })
    }

    /// Re-queue everything left unfinished by a previous run, oldest first
    pub async fn recover(self: &Arc<Self>) -> AppResult<usize> {
        let mut statuses = RUNNABLE.to_vec();
        statuses.push(SagaStatus::FailedTerminal);

        let sagas = self.ledger.list_sagas_by_status(&statuses).await?;
        let mut queued = 0;
        for saga in sagas
            .iter()
            .filter(|saga| !saga.status.is_final() || saga.blocks_user_lane())
        {
            self.enqueue(saga);
            queued += 1;
        }

        info!("♻️  Recovered {} unfinished sagas", queued);
        Ok(queued)
    }

    /// Re-queue sagas whose backoff has elapsed, plus any runnable saga nobody is driving
    pub async fn sweep(self: &Arc<Self>) -> AppResult<usize> {
        let now = Utc::now();
        let sagas = self.ledger.list_sagas_by_status(&RUNNABLE).await?;

        let mut queued = 0;
        for saga in sagas.iter().filter(|saga| saga.is_due(now)) {
            self.enqueue(saga);
            queued += 1;
        }

        if queued > 0 {
            debug!("🧹 Sweep queued {} sagas", queued);
        }
        Ok(queued)
    }

    /// Operator retry: clears the retry budget and makes the saga due now.
    /// This is the only way out of FAILED_TERMINAL.
    pub async fn retry(self: &Arc<Self>, id: &str) -> AppResult<SagaRecord> {
        let address = self.saga_address(id).await?;
        let result = {
            let lock = self.lanes.user_lock(&address);
            let _guard = lock.lock().await;
            self.retry_locked(id).await
        };
        self.lanes.prune(&address);
        result
    }

    async fn retry_locked(self: &Arc<Self>, id: &str) -> AppResult<SagaRecord> {
        let mut saga = self
            .ledger
            .get_saga(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("saga {id}")))?;

        match saga.status {
            SagaStatus::FailedRetryable | SagaStatus::FailedTerminal => {
                saga.status = SagaStatus::FailedRetryable;
            }
            SagaStatus::ConfirmationUnknown => {}
            other => {
                return Err(AppError::Conflict(format!(
                    "saga {id} is {other}, nothing to retry"
                )))
            }
        }
        saga.attempt = 0;
        saga.next_attempt_at = None;
        saga.updated_at = Utc::now();
        self.ledger.apply_transition(&saga, None).await?;

        info!("🔧 Operator retry for saga {} at {}", saga.id, saga.step);
        self.audit(&saga.id, "OPERATOR_RETRY", json!({ "step": saga.step })).await;
        self.enqueue(&saga);
        Ok(saga)
    }

    /// Operator abandon, allowed only while nothing has been submitted on chain
    pub async fn abandon(self: &Arc<Self>, id: &str) -> AppResult<SagaRecord> {
        let address = self.saga_address(id).await?;
        let result = {
            let lock = self.lanes.user_lock(&address);
            let _guard = lock.lock().await;
            self.abandon_locked(id).await
        };
        self.lanes.prune(&address);
        result
    }

    async fn abandon_locked(self: &Arc<Self>, id: &str) -> AppResult<SagaRecord> {
        let mut saga = self
            .ledger
            .get_saga(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("saga {id}")))?;

        if matches!(saga.status, SagaStatus::Completed | SagaStatus::Abandoned) {
            return Err(AppError::Conflict(format!("saga {id} is already {}", saga.status)));
        }
        if saga.has_remote_activity() {
            return Err(AppError::Conflict(format!(
                "saga {id} has already submitted a chain call at {}",
                saga.step
            )));
        }

        saga.status = SagaStatus::Abandoned;
        saga.next_attempt_at = None;
        saga.updated_at = Utc::now();
        self.ledger.apply_transition(&saga, None).await?;

        warn!("🗑️  Saga {} abandoned by operator at {}", saga.id, saga.step);
        self.audit(&saga.id, "ABANDONED", json!({ "step": saga.step })).await;

        self.lanes.remove(&saga.address, &saga.id);
        if self.lanes.wake(&saga.address) {
            self.spawn_lane(saga.address.clone());
        }
        Ok(saga)
    }

    async fn saga_address(&self, id: &str) -> AppResult<String> {
        self.ledger
            .get_saga(id)
            .await?
            .map(|saga| saga.address)
            .ok_or_else(|| AppError::NotFound(format!("saga {id}")))
    }

    fn enqueue(self: &Arc<Self>, saga: &SagaRecord) {
        if self.lanes.push(&saga.address, saga.created_at, &saga.id) {
            self.spawn_lane(saga.address.clone());
        }
    }

    fn spawn_lane(self: &Arc<Self>, address: String) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.run_lane(address).await;
        });
    }

    /// Drive a user's lane head by head until it drains or its head has to wait
    async fn run_lane(self: Arc<Self>, address: String) {
        while let Some(id) = self.lanes.next_or_release(&address) {
            let result = {
                let Ok(_permit) = self.workers.acquire().await else {
                    self.lanes.park(&address);
                    return;
                };
                let lock = self.lanes.user_lock(&address);
                let _guard = lock.lock().await;
                self.drive(&id).await
            };

            match result {
                Ok(Some(saga)) if saga.blocks_user_lane() => {
                    debug!("Lane {} parked behind saga {} ({})", address, saga.id, saga.status);
                    self.lanes.park(&address);
                    return;
                }
                Ok(_) => self.lanes.remove(&address, &id),
                Err(e) => {
                    error!("❌ Saga {} could not be driven: {}", id, e);
                    self.lanes.park(&address);
                    return;
                }
            }
        }
    }

    /// Run one saga forward until it completes or a step fails
    #[instrument(skip(self))]
    async fn drive(&self, id: &str) -> AppResult<Option<SagaRecord>> {
        let Some(mut saga) = self.ledger.get_saga(id).await? else {
            warn!("Queued saga {} not found in ledger", id);
            return Ok(None);
        };
        if saga.status.is_final() || !saga.is_due(Utc::now()) {
            return Ok(Some(saga));
        }

        while !saga.status.is_final() {
            let step = saga.step;
            let result = match saga.kind {
                SagaKind::Deposit => self.deposit_step(&mut saga).await,
                SagaKind::Withdraw => self.withdraw_step(&mut saga).await,
            };

            let error = match result {
                Ok(()) if saga.step != step => continue,
                // a step that returns without advancing would spin forever
                Ok(()) => SagaError::InvalidTransition {
                    from: step.to_string(),
                    to: step.to_string(),
                },
                Err(error) => error,
            };
            self.record_failure(&mut saga, error).await?;
            break;
        }

        Ok(Some(saga))
    }

    async fn record_failure(&self, saga: &mut SagaRecord, error: SagaError) -> AppResult<()> {
        let now = Utc::now();
        let step = saga.step;
        let retry = &self.settings.retry;
        let attempt = saga.attempt.saturating_add(1);

        let status = match error.disposition() {
            Disposition::Terminal => SagaStatus::FailedTerminal,
            _ if retry.exhausted(attempt) => SagaStatus::FailedTerminal,
            Disposition::Retryable => SagaStatus::FailedRetryable,
            Disposition::Unknown => SagaStatus::ConfirmationUnknown,
        };

        saga.attempt = attempt;
        saga.status = status;
        saga.last_error = Some(error.to_string());
        saga.next_attempt_at = if status == SagaStatus::FailedTerminal {
            None
        } else {
            let delay = chrono::Duration::from_std(retry.next_delay(attempt))
                .unwrap_or_else(|_| chrono::Duration::zero());
            Some(now + delay)
        };
        saga.updated_at = now;
        self.ledger.apply_transition(saga, None).await?;

        if status == SagaStatus::FailedTerminal {
            error!(
                "🛑 Saga {} failed terminally at {} after {} attempts: {}",
                saga.id, step, attempt, error
            );
        } else {
            warn!(
                "⚠️  Saga {} failed at {} (attempt {}, {}): {}",
                saga.id, step, attempt, status, error
            );
        }

        self.audit(
            &saga.id,
            "STEP_FAILED",
            json!({
                "step": step,
                "code": error.code(),
                "error": error.to_string(),
                "attempt": attempt,
                "status": status,
            }),
        )
        .await;
        Ok(())
    }

    /// Apply `update` to a copy of the saga and persist it together with `effect`.
    /// The in-memory record only changes once the write has committed.
    pub(super) async fn persist<F>(
        &self,
        saga: &mut SagaRecord,
        effect: Option<PositionEffect>,
        update: F,
    ) -> Result<Option<UserPosition>, SagaError>
    where
        F: FnOnce(&mut SagaRecord) -> Result<(), SagaError> + Send,
    {
        let mut next = saga.clone();
        update(&mut next)?;
        next.updated_at = Utc::now();
        let position = self.ledger.apply_transition(&next, effect).await?;
        *saga = next;
        Ok(position)
    }

    /// Persist a forward step transition
    pub(super) async fn advance<F>(
        &self,
        saga: &mut SagaRecord,
        next: SagaStep,
        effect: Option<PositionEffect>,
        update: F,
        details: serde_json::Value,
    ) -> Result<(), SagaError>
    where
        F: FnOnce(&mut SagaRecord) -> Result<(), SagaError> + Send,
    {
        let from = saga.step;
        let position = self
            .persist(saga, effect, |record| {
                update(record)?;
                record.advance_to(next)
            })
            .await?;

        info!("➡️  Saga {} {} -> {}", saga.id, from, next);
        if let Some(position) = position {
            debug!(
                "Position {} now principal={} shares={} state={}",
                position.address,
                position.principal,
                position.remote_shares,
                position.state.as_str()
            );
        }
        self.audit(&saga.id, next.as_str(), details).await;
        Ok(())
    }

    pub(super) async fn audit(&self, saga_id: &str, event_type: &str, details: serde_json::Value) {
        if let Err(e) = self.ledger.log_audit_event(saga_id, event_type, details).await {
            warn!("Failed to record audit event {} for {}: {}", event_type, saga_id, e);
        }
    }

    #[cfg(test)]
    pub fn tracked_locks(&self) -> usize {
        self.lanes.lock_count()
    }

    /// Wait until no lane has a running worker
    #[cfg(test)]
    pub async fn wait_idle(&self) {
        for _ in 0..500 {
            if self.lanes.is_idle() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("saga lanes did not settle");
    }
}
