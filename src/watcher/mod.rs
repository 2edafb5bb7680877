//! Origin event watcher: polls the origin vault for deposit and withdrawal
//! requests, forwards each confirmed log to the saga coordinator and records
//! how far it got, so a restart resumes where it stopped instead of at "now".

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain::OriginVault;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::ledger::LedgerStore;
use crate::saga::{IngestOutcome, SagaCoordinator, SagaRequest};

/// Longest pause between polls after repeated failures, as a multiple of the poll interval
const MAX_BACKOFF_FACTOR: u32 = 10;

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    /// Cursor key in the ledger
    pub stream: String,
    pub start_block: u64,
    pub confirmation_depth: u64,
    pub batch_size: u64,
    pub poll_interval: Duration,
}

impl WatcherSettings {
    pub fn from_config(config: &Config, vault_address: &str) -> Self {
        Self {
            stream: format!("origin_vault:{}", vault_address.to_lowercase()),
            start_block: config.origin_start_block,
            confirmation_depth: config.confirmation_depth,
            batch_size: config.watcher_batch_size.max(1),
            poll_interval: Duration::from_secs(config.watcher_poll_interval_secs.max(1)),
        }
    }
}

/// Result of one poll that scanned a block range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanProgress {
    pub from_block: u64,
    pub to_block: u64,
    pub safe_head: u64,
    pub created: usize,
}

impl ScanProgress {
    pub fn caught_up(&self) -> bool {
        self.to_block >= self.safe_head
    }
}

pub struct EventWatcher {
    origin: Arc<dyn OriginVault>,
    ledger: Arc<dyn LedgerStore>,
    coordinator: Arc<SagaCoordinator>,
    settings: WatcherSettings,
}

impl EventWatcher {
    pub fn new(
        origin: Arc<dyn OriginVault>,
        ledger: Arc<dyn LedgerStore>,
        coordinator: Arc<SagaCoordinator>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            origin,
            ledger,
            coordinator,
            settings,
        }
    }

    /// Start polling in the background
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "👀 Watching origin vault {} ({} confirmations)",
                self.origin.vault_address(),
                self.settings.confirmation_depth
            );

            let mut failures: u32 = 0;
            loop {
                match self.poll_once().await {
                    Ok(Some(progress)) if !progress.caught_up() => {
                        failures = 0;
                        continue;
                    }
                    Ok(_) => failures = 0,
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        error!("❌ Origin watcher poll failed ({} in a row): {}", failures, e);
                    }
                }

                let factor = 2u32.saturating_pow(failures).min(MAX_BACKOFF_FACTOR);
                tokio::time::sleep(self.settings.poll_interval * factor).await;
            }
        })
    }

    /// Scan the next confirmed block range. `Ok(None)` when there is nothing new
    /// past the confirmation depth. The cursor only moves once every event in the
    /// range has been handed to the coordinator.
    pub async fn poll_once(&self) -> AppResult<Option<ScanProgress>> {
        let head = self.origin.head_block().await?;
        let Some(safe_head) = head.checked_sub(self.settings.confirmation_depth) else {
            return Ok(None);
        };

        let cursor = self.ledger.get_cursor(&self.settings.stream).await?;
        let from_block = match cursor {
            Some(last) => last.saturating_add(1),
            None => self.settings.start_block,
        };
        if from_block > safe_head {
            return Ok(None);
        }
        let to_block = safe_head.min(from_block.saturating_add(self.settings.batch_size.saturating_sub(1)));

        let events = self.origin.fetch_events(from_block, to_block).await?;
        let mut created = 0;
        for event in &events {
            match self.coordinator.ingest(SagaRequest::from(event)).await {
                Ok(ingested) if ingested.outcome == IngestOutcome::Created => created += 1,
                Ok(ingested) => debug!(
                    "Event {} already known ({:?}, {})",
                    event.saga_id(),
                    ingested.outcome,
                    ingested.status()
                ),
                // malformed or conflicting logs can never become sagas; stalling on them would halt every user
                Err(e @ (AppError::InvalidInput(_)
                | AppError::InvalidAddress(_)
                | AppError::Conflict(_))) => {
                    warn!("⚠️  Skipping origin event {}: {}", event.saga_id(), e);
                }
                Err(e) => return Err(e),
            }
        }

        self.ledger
            .set_cursor(&self.settings.stream, to_block)
            .await?;
        info!(
            "📦 Scanned origin blocks {}..={}: {} events, {} new sagas",
            from_block,
            to_block,
            events.len(),
            created
        );

        Ok(Some(ScanProgress {
            from_block,
            to_block,
            safe_head,
            created,
        }))
    }
}
