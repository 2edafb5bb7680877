use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::fmt;

use crate::error::{AppError, AppResult, SagaError};

/// Lifecycle of a user's deployed position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "position_state", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Empty,
    Active,
    Withdrawing,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Empty => "EMPTY",
            PositionState::Active => "ACTIVE",
            PositionState::Withdrawing => "WITHDRAWING",
        }
    }
}

/// Per-user principal and remote shares. Only saga transitions write this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserPosition {
    pub address: String,
    pub principal: u128,
    pub remote_shares: u128,
    pub state: PositionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserPosition {
    pub fn empty(address: &str) -> Self {
        let now = Utc::now();
        Self {
            address: address.to_string(),
            principal: 0,
            remote_shares: 0,
            state: PositionState::Empty,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a saga effect in memory. Both store implementations share this so the
    /// arithmetic and the shares/state invariant live in one place.
    pub fn apply(&mut self, effect: &PositionEffect) -> AppResult<()> {
        match *effect {
            PositionEffect::Credit { principal, shares } => {
                if self.state == PositionState::Withdrawing {
                    return Err(AppError::Conflict(format!(
                        "position {} is mid-withdrawal",
                        self.address
                    )));
                }
                self.principal = self.principal.checked_add(principal).ok_or_else(|| {
                    AppError::Internal(format!("principal overflow for {}", self.address))
                })?;
                self.remote_shares = self.remote_shares.checked_add(shares).ok_or_else(|| {
                    AppError::Internal(format!("shares overflow for {}", self.address))
                })?;
                self.state = PositionState::Active;
            }
            PositionEffect::Redeemed => {
                self.remote_shares = 0;
                self.state = PositionState::Withdrawing;
            }
            PositionEffect::Cleared => {
                self.principal = 0;
                self.remote_shares = 0;
                self.state = PositionState::Empty;
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Position mutation committed together with a saga transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEffect {
    /// Deposit completed: add principal and minted shares, mark active.
    Credit { principal: u128, shares: u128 },
    /// Shares redeemed into manager custody; principal kept until origin release.
    Redeemed,
    /// Origin released the user's asset.
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "saga_kind", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaKind {
    Deposit,
    Withdraw,
}

impl SagaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaKind::Deposit => "DEPOSIT",
            SagaKind::Withdraw => "WITHDRAW",
        }
    }

    /// Ordered steps for this kind of saga
    pub fn steps(&self) -> &'static [SagaStep] {
        match self {
            SagaKind::Deposit => &[
                SagaStep::Received,
                SagaStep::Quoted,
                SagaStep::LiquidityChecked,
                SagaStep::Supplied,
                SagaStep::SharesRecorded,
                SagaStep::Completed,
            ],
            SagaKind::Withdraw => &[
                SagaStep::Received,
                SagaStep::SharesLookedUp,
                SagaStep::Redeemed,
                SagaStep::YieldSettled,
                SagaStep::OriginCompleted,
                SagaStep::Completed,
            ],
        }
    }
}

impl fmt::Display for SagaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "saga_step", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStep {
    Received,
    Quoted,
    LiquidityChecked,
    Supplied,
    SharesRecorded,
    SharesLookedUp,
    Redeemed,
    YieldSettled,
    OriginCompleted,
    Completed,
}

impl SagaStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::Received => "RECEIVED",
            SagaStep::Quoted => "QUOTED",
            SagaStep::LiquidityChecked => "LIQUIDITY_CHECKED",
            SagaStep::Supplied => "SUPPLIED",
            SagaStep::SharesRecorded => "SHARES_RECORDED",
            SagaStep::SharesLookedUp => "SHARES_LOOKED_UP",
            SagaStep::Redeemed => "REDEEMED",
            SagaStep::YieldSettled => "YIELD_SETTLED",
            SagaStep::OriginCompleted => "ORIGIN_COMPLETED",
            SagaStep::Completed => "COMPLETED",
        }
    }

    /// Position within the kind's ordering, `None` if the step does not belong to it
    pub fn ordinal(&self, kind: SagaKind) -> Option<usize> {
        kind.steps().iter().position(|s| s == self)
    }
}

impl fmt::Display for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "saga_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    Pending,
    StepConfirmed,
    Completed,
    FailedRetryable,
    FailedTerminal,
    ConfirmationUnknown,
    Abandoned,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "PENDING",
            SagaStatus::StepConfirmed => "STEP_CONFIRMED",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::FailedRetryable => "FAILED_RETRYABLE",
            SagaStatus::FailedTerminal => "FAILED_TERMINAL",
            SagaStatus::ConfirmationUnknown => "CONFIRMATION_UNKNOWN",
            SagaStatus::Abandoned => "ABANDONED",
        }
    }

    /// No further automatic work will happen
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::FailedTerminal | SagaStatus::Abandoned
        )
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sub-status of the withdrawal yield leg, tracked apart from origin release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "yield_leg", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum YieldLeg {
    NotRequired,
    Pending,
    Submitted,
    Confirmed,
}

impl YieldLeg {
    pub fn is_settled(&self) -> bool {
        matches!(self, YieldLeg::NotRequired | YieldLeg::Confirmed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "rate_source", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateSource {
    Oracle,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "saga_trigger", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaTrigger {
    Watcher,
    Manual,
}

/// Which tracked call a reconciliation channel belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// supply / redeem / origin completion
    Main,
    /// withdrawal yield transfer
    Yield,
}

/// Durable record of one deposit or withdrawal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaRecord {
    pub id: String,
    pub kind: SagaKind,
    pub address: String,
    pub step: SagaStep,
    pub status: SagaStatus,
    pub input_amount: u128,
    pub converted_amount: Option<u128>,
    pub principal_amount: Option<u128>,
    pub shares_amount: Option<u128>,
    pub assets_returned: Option<u128>,
    pub yield_amount: Option<u128>,
    pub rate: Option<Decimal>,
    pub rate_source: Option<RateSource>,
    pub yield_status: YieldLeg,
    pub pending_tx: Option<String>,
    pub pending_from_block: Option<u64>,
    pub yield_tx: Option<String>,
    pub yield_from_block: Option<u64>,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub origin_tx: Option<String>,
    pub origin_log_index: Option<u64>,
    pub origin_block: Option<u64>,
    pub trigger: SagaTrigger,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    pub fn new(id: String, kind: SagaKind, address: String, input_amount: u128, trigger: SagaTrigger) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            address,
            step: SagaStep::Received,
            status: SagaStatus::Pending,
            input_amount,
            converted_amount: None,
            principal_amount: None,
            shares_amount: None,
            assets_returned: None,
            yield_amount: None,
            rate: None,
            rate_source: None,
            yield_status: YieldLeg::NotRequired,
            pending_tx: None,
            pending_from_block: None,
            yield_tx: None,
            yield_from_block: None,
            attempt: 0,
            last_error: None,
            next_attempt_at: None,
            origin_tx: None,
            origin_log_index: None,
            origin_block: None,
            trigger,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move strictly forward to `next`. Resets the retry counter.
    pub fn advance_to(&mut self, next: SagaStep) -> Result<(), SagaError> {
        let invalid = || SagaError::InvalidTransition {
            from: self.step.to_string(),
            to: next.to_string(),
        };
        let from = self.step.ordinal(self.kind).ok_or_else(invalid)?;
        let to = next.ordinal(self.kind).ok_or_else(invalid)?;
        if to <= from {
            return Err(invalid());
        }
        self.step = next;
        self.status = if next == SagaStep::Completed {
            SagaStatus::Completed
        } else {
            SagaStatus::StepConfirmed
        };
        self.attempt = 0;
        self.last_error = None;
        self.next_attempt_at = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn pending(&self, leg: Leg) -> (Option<&str>, Option<u64>) {
        match leg {
            Leg::Main => (self.pending_tx.as_deref(), self.pending_from_block),
            Leg::Yield => (self.yield_tx.as_deref(), self.yield_from_block),
        }
    }

    pub fn set_pending(&mut self, leg: Leg, tx: Option<String>, from_block: Option<u64>) {
        match leg {
            Leg::Main => {
                self.pending_tx = tx;
                self.pending_from_block = from_block;
            }
            Leg::Yield => {
                self.yield_tx = tx;
                self.yield_from_block = from_block;
            }
        }
        self.updated_at = Utc::now();
    }

    pub fn clear_pending(&mut self, leg: Leg) {
        self.set_pending(leg, None, None);
    }

    /// Any remote or origin call has been submitted (or was about to be) for this saga
    pub fn has_remote_activity(&self) -> bool {
        let past_local_steps = match self.kind {
            SagaKind::Deposit => self.step.ordinal(self.kind) > SagaStep::LiquidityChecked.ordinal(self.kind),
            SagaKind::Withdraw => self.step.ordinal(self.kind) > SagaStep::SharesLookedUp.ordinal(self.kind),
        };
        past_local_steps || self.pending_from_block.is_some() || self.yield_from_block.is_some()
    }

    /// The position is mid-withdrawal because of this saga: shares redeemed (or a
    /// redeem of unknown outcome), origin asset not yet released.
    pub fn holds_position(&self) -> bool {
        if self.kind != SagaKind::Withdraw {
            return false;
        }
        match self.step {
            SagaStep::Redeemed | SagaStep::YieldSettled => true,
            SagaStep::SharesLookedUp => self.pending_from_block.is_some(),
            _ => false,
        }
    }

    /// Later sagas for the same address must wait behind this one
    pub fn blocks_user_lane(&self) -> bool {
        // only the yield leg is left, and it never touches the position
        if self.kind == SagaKind::Withdraw && self.step == SagaStep::OriginCompleted {
            return false;
        }
        match self.status {
            SagaStatus::Completed | SagaStatus::Abandoned => false,
            SagaStatus::FailedTerminal => self.holds_position(),
            _ => true,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Append-only saga history entry
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub saga_id: String,
    pub event_type: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Ledger-wide totals over user positions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub total_principal: u128,
    pub total_shares: u128,
    pub active_users: u64,
    pub withdrawing_users: u64,
}

/// Saga counts grouped by kind and status, plus realized yield
#[derive(Debug, Clone, Default, Serialize)]
pub struct SagaStats {
    pub counts: Vec<SagaCount>,
    pub realized_yield: u128,
    pub stale: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SagaCount {
    pub kind: SagaKind,
    pub status: SagaStatus,
    pub count: u64,
}

impl SagaStats {
    pub fn count_status(&self, status: SagaStatus) -> u64 {
        self.counts
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.count)
            .sum()
    }
}
