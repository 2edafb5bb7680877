pub mod models;
pub mod repository;
#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppResult;
use models::{
    AuditEntry, LedgerTotals, PositionEffect, SagaRecord, SagaStats, SagaStatus, UserPosition,
};

pub use repository::LedgerRepository;

/// Durable source of truth for positions, sagas and watcher progress.
///
/// Every write that touches a position goes through [`LedgerStore::apply_transition`],
/// which commits the saga row and the position change together.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_position(&self, address: &str) -> AppResult<Option<UserPosition>>;

    /// Insert a new saga. Returns `false` (and writes nothing) if the id already exists.
    async fn insert_saga(&self, saga: &SagaRecord) -> AppResult<bool>;

    async fn get_saga(&self, id: &str) -> AppResult<Option<SagaRecord>>;

    /// Persist the saga's current fields and, atomically, an optional position effect.
    /// Returns the position after the effect when one was applied.
    async fn apply_transition(
        &self,
        saga: &SagaRecord,
        effect: Option<PositionEffect>,
    ) -> AppResult<Option<UserPosition>>;

    async fn list_sagas_by_status(&self, statuses: &[SagaStatus]) -> AppResult<Vec<SagaRecord>>;

    async fn list_user_sagas(&self, address: &str, limit: i64) -> AppResult<Vec<SagaRecord>>;

    async fn ledger_totals(&self) -> AppResult<LedgerTotals>;

    /// Counts per kind/status; `stale` counts unfinished sagas untouched since `stale_before`.
    async fn saga_stats(&self, stale_before: DateTime<Utc>) -> AppResult<SagaStats>;

    async fn get_cursor(&self, stream: &str) -> AppResult<Option<u64>>;

    async fn set_cursor(&self, stream: &str, last_block: u64) -> AppResult<()>;

    async fn log_audit_event(
        &self,
        saga_id: &str,
        event_type: &str,
        details: serde_json::Value,
    ) -> AppResult<()>;

    async fn list_audit(&self, saga_id: &str) -> AppResult<Vec<AuditEntry>>;
}
