use serde_json::json;
use tracing::{info, warn};

use super::SagaCoordinator;
use crate::chain::{ChainCall, Landed, TxOutcome, TxSubmitter};
use crate::error::{ChainError, SagaError};
use crate::ledger::models::{Leg, SagaRecord, YieldLeg};

impl SagaCoordinator {
    /// Resolve a call left in flight by an earlier attempt. `Ok(Some)` means it landed and
    /// must not be sent again; `Ok(None)` means nothing happened on chain and it is safe to submit.
    pub(super) async fn reconcile_call<C, L>(
        &self,
        saga: &mut SagaRecord,
        leg: Leg,
        target: &L,
        call: &C,
    ) -> Result<Option<Landed>, SagaError>
    where
        C: ChainCall,
        L: TxSubmitter<C> + ?Sized,
    {
        let (tx_hash, from_block) = saga.pending(leg);
        let Some(from_block) = from_block else {
            return Ok(None);
        };
        let tx_hash = tx_hash.map(str::to_string);

        let outcome = target
            .probe_outcome(call, tx_hash.as_deref(), from_block)
            .await?;

        match outcome {
            TxOutcome::Landed(landed) => {
                info!(
                    "🔎 Saga {}: earlier {} landed in {}",
                    saga.id,
                    call.operation(),
                    landed.tx_hash
                );
                self.audit(
                    &saga.id,
                    "RECONCILED",
                    json!({ "operation": call.operation(), "tx_hash": landed.tx_hash, "found": true }),
                )
                .await;
                Ok(Some(landed))
            }
            TxOutcome::InFlight { tx_hash } => Err(SagaError::ConfirmationUnknown {
                operation: call.operation().to_string(),
                tx_hash,
            }),
            TxOutcome::Reverted { tx_hash, reason } => {
                self.release_channel(saga, leg).await?;
                Err(SagaError::RemoteCallReverted {
                    operation: call.operation().to_string(),
                    tx_hash: Some(tx_hash),
                    reason,
                })
            }
            TxOutcome::NotFound => {
                warn!(
                    "Saga {}: no trace of {} since block {}, will resubmit",
                    saga.id,
                    call.operation(),
                    from_block
                );
                self.release_channel(saga, leg).await?;
                self.audit(
                    &saga.id,
                    "RECONCILED",
                    json!({ "operation": call.operation(), "tx_hash": tx_hash, "found": false }),
                )
                .await;
                Ok(None)
            }
        }
    }

    /// Submit a call through the reconciliation channel and wait for its outcome.
    ///
    /// The channel's start block is durable before anything is broadcast and the hash is
    /// durable right after, so a crash at any point leaves enough behind to probe.
    pub(super) async fn submit_call<C, L>(
        &self,
        saga: &mut SagaRecord,
        leg: Leg,
        target: &L,
        call: &C,
    ) -> Result<Landed, SagaError>
    where
        C: ChainCall,
        L: TxSubmitter<C> + ?Sized,
    {
        let operation = call.operation();
        let from_block = target.head_block().await?.saturating_add(1);
        self.persist(saga, None, |record| {
            record.set_pending(leg, None, Some(from_block));
            if leg == Leg::Yield {
                record.yield_status = YieldLeg::Submitted;
            }
            Ok(())
        })
        .await?;

        let tx_hash = match target.submit(call).await {
            Ok(tx_hash) => tx_hash,
            Err(ChainError::Reverted { reason, .. }) => {
                self.release_channel(saga, leg).await?;
                return Err(SagaError::RemoteCallReverted {
                    operation: operation.to_string(),
                    tx_hash: None,
                    reason,
                });
            }
            // the broadcast may or may not have happened; the channel stays open for the probe
            Err(e) => return Err(SagaError::Transient(format!("{operation}: {e}"))),
        };

        let recorded = tx_hash.clone();
        self.persist(saga, None, |record| {
            record.set_pending(leg, Some(recorded), Some(from_block));
            Ok(())
        })
        .await?;
        self.audit(
            &saga.id,
            "SUBMITTED",
            json!({ "operation": operation, "tx_hash": tx_hash, "from_block": from_block }),
        )
        .await;

        let unknown = |tx_hash: String| SagaError::ConfirmationUnknown {
            operation: operation.to_string(),
            tx_hash,
        };

        match target.await_outcome(call, &tx_hash).await {
            Ok(TxOutcome::Landed(landed)) => Ok(landed),
            Ok(TxOutcome::Reverted { tx_hash, reason }) => {
                self.release_channel(saga, leg).await?;
                Err(SagaError::RemoteCallReverted {
                    operation: operation.to_string(),
                    tx_hash: Some(tx_hash),
                    reason,
                })
            }
            Ok(TxOutcome::InFlight { tx_hash }) => Err(unknown(tx_hash)),
            Ok(TxOutcome::NotFound) => Err(unknown(tx_hash)),
            Err(e) => {
                warn!("Saga {}: lost track of {} {}: {}", saga.id, operation, tx_hash, e);
                Err(unknown(tx_hash))
            }
        }
    }

    /// Forget the channel of a call that provably had no effect
    async fn release_channel(&self, saga: &mut SagaRecord, leg: Leg) -> Result<(), SagaError> {
        self.persist(saga, None, |record| {
            record.clear_pending(leg);
            if leg == Leg::Yield && record.yield_status == YieldLeg::Submitted {
                record.yield_status = YieldLeg::Pending;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }
}
