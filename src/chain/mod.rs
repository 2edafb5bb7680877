pub mod confirm;
pub mod origin;
pub mod remote;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use serde::Serialize;

use crate::error::ChainError;
use crate::ledger::models::SagaKind;

pub use origin::EvmOriginVault;
pub use remote::EvmRemoteLedger;

/// A call the saga coordinator makes on the remote yield manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    /// Supply settlement currency on behalf of `beneficiary`. Lands with shares minted.
    Supply { beneficiary: String, amount: u128 },
    /// Redeem `owner`'s shares into the manager's custody. Lands with assets returned.
    Redeem { owner: String, shares: u128 },
    /// Pay realized yield out to the user on the remote chain.
    TransferYield { user: String, amount: u128 },
}

/// A state-changing call tracked through the reconciliation channel
pub trait ChainCall: Send + Sync {
    /// Contract method name, used in logs and errors
    fn operation(&self) -> &'static str;
}

impl ChainCall for RemoteCall {
    fn operation(&self) -> &'static str {
        match self {
            RemoteCall::Supply { .. } => "supply",
            RemoteCall::Redeem { .. } => "redeem",
            RemoteCall::TransferYield { .. } => "transferYield",
        }
    }
}

/// A call on the origin vault
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginCall {
    /// Release the user's original asset. Lands with the shares released.
    CompleteWithdraw { user: String, shares: u128 },
}

impl ChainCall for OriginCall {
    fn operation(&self) -> &'static str {
        match self {
            OriginCall::CompleteWithdraw { .. } => "completeWithdraw",
        }
    }
}

/// Confirmed effect of a call, decoded from its receipt or from the effect event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Landed {
    pub tx_hash: String,
    pub block_number: u64,
    /// Call-specific result: shares minted, assets returned, amount transferred or shares released
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Landed(Landed),
    /// Mined and reverted; no effect on chain.
    Reverted { tx_hash: String, reason: String },
    /// Known to the node but not (sufficiently) confirmed.
    InFlight { tx_hash: String },
    /// Neither the transaction nor its effect can be found.
    NotFound,
}

/// Send, wait and reconcile for one ledger's calls
#[async_trait]
pub trait TxSubmitter<C: ChainCall>: Send + Sync {
    async fn head_block(&self) -> Result<u64, ChainError>;

    /// Broadcast the call. Returns the transaction hash.
    async fn submit(&self, call: &C) -> Result<String, ChainError>;

    /// Wait (bounded) for the transaction's confirmation. A timeout is `InFlight`, never an error.
    async fn await_outcome(&self, call: &C, tx_hash: &str) -> Result<TxOutcome, ChainError>;

    /// Re-query chain state for the call's effect: first by `tx_hash`, then by
    /// scanning the effect event emitted at or after `from_block`.
    async fn probe_outcome(
        &self,
        call: &C,
        tx_hash: Option<&str>,
        from_block: u64,
    ) -> Result<TxOutcome, ChainError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteTotals {
    pub total_supplied: u128,
    pub total_assets: u128,
}

impl RemoteTotals {
    pub fn total_yield(&self) -> u128 {
        self.total_assets.saturating_sub(self.total_supplied)
    }
}

/// Remote yield manager: calls plus read-only views
#[async_trait]
pub trait RemoteLedger: TxSubmitter<RemoteCall> {
    /// Settlement currency the manager can supply right now
    async fn available_balance(&self) -> Result<u128, ChainError>;

    async fn user_yield(&self, user: &str) -> Result<u128, ChainError>;

    async fn user_shares(&self, user: &str) -> Result<u128, ChainError>;

    async fn totals(&self) -> Result<RemoteTotals, ChainError>;

    fn manager_address(&self) -> String;

    fn operator_address(&self) -> String;
}

/// Deposit or withdrawal request observed on the origin vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OriginEvent {
    pub kind: SagaKind,
    pub user: String,
    /// Asset amount for deposits, vault shares for withdrawals
    pub amount: u128,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub timestamp: u64,
}

impl OriginEvent {
    pub fn saga_id(&self) -> String {
        event_saga_id(&self.tx_hash, self.log_index)
    }
}

/// Origin vault: event source plus the completion call
#[async_trait]
pub trait OriginVault: TxSubmitter<OriginCall> {
    /// Deposit and WithdrawRequested events in `[from_block, to_block]`, ordered by (block, log index)
    async fn fetch_events(&self, from_block: u64, to_block: u64)
        -> Result<Vec<OriginEvent>, ChainError>;

    async fn user_balance(&self, user: &str) -> Result<u128, ChainError>;

    fn vault_address(&self) -> String;

    fn operator_address(&self) -> String;
}

/// Deterministic saga id for an origin log
pub fn event_saga_id(tx_hash: &str, log_index: u64) -> String {
    format!("{}:{}", tx_hash.to_lowercase(), log_index)
}

/// Parse and render an address in EIP-55 checksum form
pub fn normalize_address(raw: &str) -> Result<String, ChainError> {
    parse_address(raw).map(|a| a.to_checksum(None))
}

pub fn parse_address(raw: &str) -> Result<Address, ChainError> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| ChainError::InvalidAddress(format!("{raw}: {e}")))
}

pub fn to_amount(value: U256) -> Result<u128, ChainError> {
    u128::try_from(value).map_err(|_| ChainError::AmountOutOfRange(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address_checksums() {
        let normalized =
            normalize_address("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed").unwrap();
        assert_eq!(normalized, "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed");
        assert!(normalize_address("not-an-address").is_err());
    }

    #[test]
    fn test_event_saga_id_is_stable() {
        assert_eq!(event_saga_id("0xABcd", 3), "0xabcd:3");
    }

    #[test]
    fn test_to_amount_bounds() {
        assert_eq!(to_amount(U256::from(42u64)).unwrap(), 42);
        assert!(to_amount(U256::MAX).is_err());
    }

    #[test]
    fn test_remote_total_yield_never_negative() {
        let totals = RemoteTotals { total_supplied: 10, total_assets: 7 };
        assert_eq!(totals.total_yield(), 0);
    }
}
