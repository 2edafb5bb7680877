use std::time::{Duration, Instant};

use alloy::primitives::TxHash;
use alloy::providers::{DynProvider, Provider};
use alloy::rpc::types::TransactionReceipt;
use tracing::{debug, warn};

use crate::error::ChainError;

/// How long and how deep to wait for a transaction
#[derive(Debug, Clone)]
pub struct ConfirmationPolicy {
    pub confirmations: u64,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// What the node knows about a transaction hash
#[derive(Debug)]
pub enum TxLookup {
    /// Mined with at least the required confirmations
    Confirmed(Box<TransactionReceipt>),
    /// In the mempool, or mined but still shallow
    Pending,
    /// The node has never heard of it (dropped or never broadcast)
    Unknown,
}

pub fn parse_tx_hash(raw: &str) -> Result<TxHash, ChainError> {
    raw.parse::<TxHash>()
        .map_err(|e| ChainError::Decode(format!("tx hash {raw}: {e}")))
}

pub fn format_tx_hash(hash: &TxHash) -> String {
    format!("{:#x}", hash)
}

pub async fn lookup_tx(
    provider: &DynProvider,
    tx_hash: TxHash,
    confirmations: u64,
) -> Result<TxLookup, ChainError> {
    let receipt = provider
        .get_transaction_receipt(tx_hash)
        .await
        .map_err(|e| ChainError::Rpc(e.to_string()))?;

    if let Some(receipt) = receipt {
        let Some(mined_at) = receipt.block_number else {
            return Ok(TxLookup::Pending);
        };
        let head = provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        if head.saturating_add(1) >= mined_at.saturating_add(confirmations.max(1)) {
            return Ok(TxLookup::Confirmed(Box::new(receipt)));
        }
        return Ok(TxLookup::Pending);
    }

    let tx = provider
        .get_transaction_by_hash(tx_hash)
        .await
        .map_err(|e| ChainError::Rpc(e.to_string()))?;

    Ok(if tx.is_some() {
        TxLookup::Pending
    } else {
        TxLookup::Unknown
    })
}

/// Poll for the receipt until it is deep enough or the policy times out.
/// `Ok(None)` means the wait timed out; the outcome is unknown.
pub async fn wait_for_confirmation(
    provider: &DynProvider,
    tx_hash: TxHash,
    policy: &ConfirmationPolicy,
) -> Result<Option<TransactionReceipt>, ChainError> {
    let start = Instant::now();
    let mut last_error = None;

    loop {
        if start.elapsed() > policy.timeout {
            warn!(
                "⏰ Confirmation timeout for {:#x} after {:?} (last error: {:?})",
                tx_hash, policy.timeout, last_error
            );
            return Ok(None);
        }

        match lookup_tx(provider, tx_hash, policy.confirmations).await {
            Ok(TxLookup::Confirmed(receipt)) => {
                debug!("✓ {:#x} confirmed in block {:?}", tx_hash, receipt.block_number);
                return Ok(Some(*receipt));
            }
            Ok(TxLookup::Pending) | Ok(TxLookup::Unknown) => {}
            // keep polling through transient RPC failures until the deadline
            Err(e) => last_error = Some(e),
        }

        tokio::time::sleep(policy.poll_interval).await;
    }
}

/// Classify a failed `send()`. Gas estimation surfaces contract reverts before
/// anything is broadcast, so those are safe to treat as "no effect".
pub fn send_error(operation: &str, error: alloy::contract::Error) -> ChainError {
    let message = error.to_string();
    if message.to_lowercase().contains("revert") {
        warn!("{} rejected by contract: {}", operation, message);
        ChainError::Reverted {
            operation: operation.to_string(),
            reason: message,
        }
    } else {
        warn!("{} failed to send: {}", operation, message);
        ChainError::Rpc(message)
    }
}

pub fn rpc_error(error: impl std::fmt::Display) -> ChainError {
    ChainError::Rpc(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_hash_round_trip() {
        let raw = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060";
        let hash = parse_tx_hash(raw).unwrap();
        assert_eq!(format_tx_hash(&hash), raw);
        assert!(parse_tx_hash("0x1234").is_err());
    }
}
