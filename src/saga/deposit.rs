use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, warn};

use super::convert::convert_amount;
use super::SagaCoordinator;
use crate::chain::RemoteCall;
use crate::error::SagaError;
use crate::ledger::models::{Leg, PositionEffect, RateSource, SagaRecord, SagaStep};

impl SagaCoordinator {
    /// Run the deposit step that follows `saga.step`
    pub(super) async fn deposit_step(&self, saga: &mut SagaRecord) -> Result<(), SagaError> {
        match saga.step {
            SagaStep::Received => {
                let (rate, source) = self.quote_rate().await?;
                let converted = convert_amount(
                    saga.input_amount,
                    rate,
                    self.settings.asset_decimals,
                    self.settings.settlement_decimals,
                )?;
                if converted == 0 {
                    return Err(SagaError::Conversion(format!(
                        "{} at rate {} converts to zero",
                        saga.input_amount, rate
                    )));
                }

                info!(
                    "💱 Saga {}: {} -> {} at {} ({:?})",
                    saga.id, saga.input_amount, converted, rate, source
                );
                self.advance(
                    saga,
                    SagaStep::Quoted,
                    None,
                    |record| {
                        record.rate = Some(rate);
                        record.rate_source = Some(source);
                        record.converted_amount = Some(converted);
                        Ok(())
                    },
                    json!({
                        "rate": rate.to_string(),
                        "rate_source": source,
                        "converted_amount": converted.to_string(),
                    }),
                )
                .await
            }

            SagaStep::Quoted => {
                let required = converted_amount(saga)?;
                let available = self.ensure_liquidity(required).await?;
                self.advance(
                    saga,
                    SagaStep::LiquidityChecked,
                    None,
                    |_| Ok(()),
                    json!({ "required": required.to_string(), "available": available.to_string() }),
                )
                .await
            }

            SagaStep::LiquidityChecked => {
                let amount = converted_amount(saga)?;
                let call = RemoteCall::Supply {
                    beneficiary: saga.address.clone(),
                    amount,
                };

                let landed = match self.reconcile_call(saga, Leg::Main, &*self.remote, &call).await? {
                    Some(landed) => landed,
                    None => {
                        // float may have moved since the first check
                        if saga.attempt > 0 {
                            self.ensure_liquidity(amount).await?;
                        }
                        self.submit_call(saga, Leg::Main, &*self.remote, &call).await?
                    }
                };

                let shares = landed.amount;
                self.advance(
                    saga,
                    SagaStep::Supplied,
                    None,
                    |record| {
                        record.shares_amount = Some(shares);
                        record.clear_pending(Leg::Main);
                        Ok(())
                    },
                    json!({ "tx_hash": landed.tx_hash, "shares": shares.to_string() }),
                )
                .await
            }

            SagaStep::Supplied => {
                let principal = converted_amount(saga)?;
                let shares = saga.shares_amount.ok_or_else(|| {
                    SagaError::Ledger(format!("saga {} supplied without shares", saga.id))
                })?;

                // shares and principal land on the position in the same write that completes the saga
                self.advance(
                    saga,
                    SagaStep::Completed,
                    Some(PositionEffect::Credit { principal, shares }),
                    |record| record.advance_to(SagaStep::SharesRecorded),
                    json!({ "principal": principal.to_string(), "shares": shares.to_string() }),
                )
                .await?;

                info!(
                    "✅ Deposit saga {} completed: {} credited {} principal / {} shares",
                    saga.id, saga.address, principal, shares
                );
                Ok(())
            }

            step => Err(SagaError::InvalidTransition {
                from: step.to_string(),
                to: "next deposit step".to_string(),
            }),
        }
    }

    /// Current conversion rate: the oracle's quote, or the configured fallback in degraded mode
    async fn quote_rate(&self) -> Result<(Decimal, RateSource), SagaError> {
        let symbol = &self.settings.oracle_symbol;
        let reason = match self.oracle.quote(symbol).await {
            Ok(quote) if quote.stale && self.settings.reject_stale_quotes => format!(
                "{} quote from {} is {}s old",
                symbol,
                self.oracle.name(),
                quote.age_secs(Utc::now())
            ),
            Ok(quote) => {
                if quote.stale {
                    warn!("⚠️  Using stale {} quote {} from {}", symbol, quote.price_usd, quote.observed_at);
                }
                return Ok((quote.price_usd, RateSource::Oracle));
            }
            Err(e) => e.to_string(),
        };

        match self.settings.fallback_rate {
            Some(rate) => {
                warn!("⚠️  Degraded mode: using fallback rate {} ({})", rate, reason);
                Ok((rate, RateSource::Fallback))
            }
            None => Err(SagaError::OracleUnavailable(reason)),
        }
    }

    async fn ensure_liquidity(&self, required: u128) -> Result<u128, SagaError> {
        let available = self.remote.available_balance().await?;
        if available < required {
            return Err(SagaError::InsufficientRemoteLiquidity { required, available });
        }
        Ok(available)
    }
}

fn converted_amount(saga: &SagaRecord) -> Result<u128, SagaError> {
    saga.converted_amount
        .ok_or_else(|| SagaError::Ledger(format!("saga {} has no converted amount", saga.id)))
}
