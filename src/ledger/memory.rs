//! In-memory ledger used by tests. Mirrors the Postgres semantics: saga and
//! position writes in `apply_transition` land together or not at all.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::models::*;
use super::LedgerStore;
use crate::error::{AppError, AppResult};

#[derive(Default)]
struct Inner {
    positions: HashMap<String, UserPosition>,
    sagas: HashMap<String, SagaRecord>,
    cursors: HashMap<String, u64>,
    audit: Vec<AuditEntry>,
    /// Every position write, in commit order
    position_writes: Vec<(String, PositionEffect)>,
}

#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position_writes(&self) -> Vec<(String, PositionEffect)> {
        self.inner.lock().position_writes.clone()
    }

    pub fn audit_types(&self, saga_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .audit
            .iter()
            .filter(|e| e.saga_id == saga_id)
            .map(|e| e.event_type.clone())
            .collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn get_position(&self, address: &str) -> AppResult<Option<UserPosition>> {
        Ok(self.inner.lock().positions.get(address).cloned())
    }

    async fn insert_saga(&self, saga: &SagaRecord) -> AppResult<bool> {
        let mut inner = self.inner.lock();
        if inner.sagas.contains_key(&saga.id) {
            return Ok(false);
        }
        inner.sagas.insert(saga.id.clone(), saga.clone());
        Ok(true)
    }

    async fn get_saga(&self, id: &str) -> AppResult<Option<SagaRecord>> {
        Ok(self.inner.lock().sagas.get(id).cloned())
    }

    async fn apply_transition(
        &self,
        saga: &SagaRecord,
        effect: Option<PositionEffect>,
    ) -> AppResult<Option<UserPosition>> {
        let mut inner = self.inner.lock();
        if !inner.sagas.contains_key(&saga.id) {
            return Err(AppError::NotFound(format!("saga {}", saga.id)));
        }

        let position = match effect {
            Some(effect) => {
                let mut position = inner
                    .positions
                    .get(&saga.address)
                    .cloned()
                    .unwrap_or_else(|| UserPosition::empty(&saga.address));
                position.apply(&effect)?;
                inner
                    .positions
                    .insert(saga.address.clone(), position.clone());
                inner.position_writes.push((saga.address.clone(), effect));
                Some(position)
            }
            None => None,
        };

        inner.sagas.insert(saga.id.clone(), saga.clone());
        Ok(position)
    }

    async fn list_sagas_by_status(&self, statuses: &[SagaStatus]) -> AppResult<Vec<SagaRecord>> {
        let inner = self.inner.lock();
        let mut sagas: Vec<SagaRecord> = inner
            .sagas
            .values()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect();
        sagas.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sagas)
    }

    async fn list_user_sagas(&self, address: &str, limit: i64) -> AppResult<Vec<SagaRecord>> {
        let inner = self.inner.lock();
        let mut sagas: Vec<SagaRecord> = inner
            .sagas
            .values()
            .filter(|s| s.address == address)
            .cloned()
            .collect();
        sagas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sagas.truncate(limit.max(0) as usize);
        Ok(sagas)
    }

    async fn ledger_totals(&self) -> AppResult<LedgerTotals> {
        let inner = self.inner.lock();
        let mut totals = LedgerTotals::default();
        for position in inner.positions.values() {
            totals.total_principal += position.principal;
            totals.total_shares += position.remote_shares;
            match position.state {
                PositionState::Active => totals.active_users += 1,
                PositionState::Withdrawing => totals.withdrawing_users += 1,
                PositionState::Empty => {}
            }
        }
        Ok(totals)
    }

    async fn saga_stats(&self, stale_before: DateTime<Utc>) -> AppResult<SagaStats> {
        let inner = self.inner.lock();
        let mut counts: HashMap<(SagaKind, SagaStatus), u64> = HashMap::new();
        let mut stats = SagaStats::default();
        for saga in inner.sagas.values() {
            *counts.entry((saga.kind, saga.status)).or_default() += 1;
            if saga.kind == SagaKind::Withdraw {
                stats.realized_yield += saga.yield_amount.unwrap_or(0);
            }
            if !saga.status.is_final() && saga.updated_at < stale_before {
                stats.stale += 1;
            }
        }
        stats.counts = counts
            .into_iter()
            .map(|((kind, status), count)| SagaCount { kind, status, count })
            .collect();
        Ok(stats)
    }

    async fn get_cursor(&self, stream: &str) -> AppResult<Option<u64>> {
        Ok(self.inner.lock().cursors.get(stream).copied())
    }

    async fn set_cursor(&self, stream: &str, last_block: u64) -> AppResult<()> {
        let mut inner = self.inner.lock();
        let cursor = inner.cursors.entry(stream.to_string()).or_insert(last_block);
        *cursor = (*cursor).max(last_block);
        Ok(())
    }

    async fn log_audit_event(
        &self,
        saga_id: &str,
        event_type: &str,
        details: serde_json::Value,
    ) -> AppResult<()> {
        self.inner.lock().audit.push(AuditEntry {
            saga_id: saga_id.to_string(),
            event_type: event_type.to_string(),
            details,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_audit(&self, saga_id: &str) -> AppResult<Vec<AuditEntry>> {
        Ok(self
            .inner
            .lock()
            .audit
            .iter()
            .filter(|e| e.saga_id == saga_id)
            .cloned()
            .collect())
    }
}
