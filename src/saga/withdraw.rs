use serde_json::json;
use tracing::{info, warn};

use super::SagaCoordinator;
use crate::chain::{OriginCall, RemoteCall};
use crate::error::SagaError;
use crate::ledger::models::{
    Leg, PositionEffect, PositionState, SagaRecord, SagaStep, YieldLeg,
};

impl SagaCoordinator {
    /// Run the withdrawal step that follows `saga.step`
    pub(super) async fn withdraw_step(&self, saga: &mut SagaRecord) -> Result<(), SagaError> {
        match saga.step {
            SagaStep::Received => {
                let position = self
                    .ledger
                    .get_position(&saga.address)
                    .await?
                    .filter(|p| p.state == PositionState::Active && p.remote_shares > 0)
                    .ok_or_else(|| SagaError::NoPositionFound(saga.address.clone()))?;

                let (principal, shares) = (position.principal, position.remote_shares);
                self.advance(
                    saga,
                    SagaStep::SharesLookedUp,
                    None,
                    |record| {
                        record.principal_amount = Some(principal);
                        record.shares_amount = Some(shares);
                        Ok(())
                    },
                    json!({ "principal": principal.to_string(), "shares": shares.to_string() }),
                )
                .await
            }

            SagaStep::SharesLookedUp => {
                let shares = recorded(saga.shares_amount, &saga.id, "shares")?;
                let principal = recorded(saga.principal_amount, &saga.id, "principal")?;
                let call = RemoteCall::Redeem {
                    owner: saga.address.clone(),
                    shares,
                };

                let landed = match self.reconcile_call(saga, Leg::Main, &*self.remote, &call).await? {
                    Some(landed) => landed,
                    None => self.submit_call(saga, Leg::Main, &*self.remote, &call).await?,
                };

                let assets = landed.amount;
                let yield_amount = assets.saturating_sub(principal);
                info!(
                    "💰 Saga {}: redeemed {} shares for {} (principal {}, yield {})",
                    saga.id, shares, assets, principal, yield_amount
                );

                self.advance(
                    saga,
                    SagaStep::Redeemed,
                    Some(PositionEffect::Redeemed),
                    |record| {
                        record.assets_returned = Some(assets);
                        record.yield_amount = Some(yield_amount);
                        record.yield_status = if yield_amount > 0 {
                            YieldLeg::Pending
                        } else {
                            YieldLeg::NotRequired
                        };
                        record.clear_pending(Leg::Main);
                        Ok(())
                    },
                    json!({
                        "tx_hash": landed.tx_hash,
                        "assets_returned": assets.to_string(),
                        "yield_amount": yield_amount.to_string(),
                    }),
                )
                .await
            }

            SagaStep::Redeemed => {
                // the yield leg gets one try here; failing it must not hold back the origin release
                if let Err(e) = self.settle_yield(saga).await {
                    warn!(
                        "⚠️  Saga {}: yield transfer deferred, releasing origin first: {}",
                        saga.id, e
                    );
                    self.audit(
                        &saga.id,
                        "YIELD_DEFERRED",
                        json!({ "code": e.code(), "error": e.to_string() }),
                    )
                    .await;
                }

                let yield_status = saga.yield_status;
                self.advance(
                    saga,
                    SagaStep::YieldSettled,
                    None,
                    |_| Ok(()),
                    json!({ "yield_status": yield_status }),
                )
                .await
            }

            SagaStep::YieldSettled => {
                let call = OriginCall::CompleteWithdraw {
                    user: saga.address.clone(),
                    shares: saga.input_amount,
                };

                let landed = match self.reconcile_call(saga, Leg::Main, &*self.origin, &call).await? {
                    Some(landed) => landed,
                    None => self.submit_call(saga, Leg::Main, &*self.origin, &call).await?,
                };

                self.advance(
                    saga,
                    SagaStep::OriginCompleted,
                    Some(PositionEffect::Cleared),
                    |record| {
                        record.clear_pending(Leg::Main);
                        Ok(())
                    },
                    json!({ "tx_hash": landed.tx_hash, "shares": landed.amount.to_string() }),
                )
                .await?;
                info!("🔓 Saga {}: origin released for {}", saga.id, saga.address);

                if saga.yield_status.is_settled() {
                    self.finish_withdraw(saga).await
                } else {
                    // park until the sweep retries the yield leg on its own schedule
                    Err(yield_outstanding(saga))
                }
            }

            SagaStep::OriginCompleted => {
                self.settle_yield(saga).await?;
                self.finish_withdraw(saga).await
            }

            step => Err(SagaError::InvalidTransition {
                from: step.to_string(),
                to: "next withdrawal step".to_string(),
            }),
        }
    }

    /// Transfer realized yield to the user on the remote chain, tracked on its own channel
    async fn settle_yield(&self, saga: &mut SagaRecord) -> Result<(), SagaError> {
        if saga.yield_status.is_settled() {
            return Ok(());
        }

        let call = RemoteCall::TransferYield {
            user: saga.address.clone(),
            amount: recorded(saga.yield_amount, &saga.id, "yield")?,
        };
        let landed = match self.reconcile_call(saga, Leg::Yield, &*self.remote, &call).await? {
            Some(landed) => landed,
            None => self.submit_call(saga, Leg::Yield, &*self.remote, &call).await?,
        };

        self.persist(saga, None, |record| {
            record.yield_status = YieldLeg::Confirmed;
            record.clear_pending(Leg::Yield);
            Ok(())
        })
        .await?;

        info!("💸 Saga {}: yield {} transferred in {}", saga.id, landed.amount, landed.tx_hash);
        self.audit(
            &saga.id,
            "YIELD_TRANSFERRED",
            json!({ "tx_hash": landed.tx_hash, "amount": landed.amount.to_string() }),
        )
        .await;
        Ok(())
    }

    async fn finish_withdraw(&self, saga: &mut SagaRecord) -> Result<(), SagaError> {
        let yield_status = saga.yield_status;
        self.advance(
            saga,
            SagaStep::Completed,
            None,
            |_| Ok(()),
            json!({ "yield_status": yield_status }),
        )
        .await?;
        info!("✅ Withdrawal saga {} completed for {}", saga.id, saga.address);
        Ok(())
    }
}

fn recorded(value: Option<u128>, saga_id: &str, field: &str) -> Result<u128, SagaError> {
    value.ok_or_else(|| SagaError::Ledger(format!("saga {saga_id} has no recorded {field}")))
}

fn yield_outstanding(saga: &SagaRecord) -> SagaError {
    match (saga.yield_status, saga.yield_tx.as_deref()) {
        (YieldLeg::Submitted, Some(tx_hash)) => SagaError::ConfirmationUnknown {
            operation: "transferYield".to_string(),
            tx_hash: tx_hash.to_string(),
        },
        _ => SagaError::Transient(format!(
            "yield transfer of {} still pending",
            saga.yield_amount.unwrap_or(0)
        )),
    }
}
