use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log, TransactionReceipt};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::confirm::{
    format_tx_hash, lookup_tx, parse_tx_hash, rpc_error, send_error, wait_for_confirmation,
    ConfirmationPolicy, TxLookup,
};
use super::{parse_address, ChainCall, to_amount, Landed, OriginCall, OriginEvent, OriginVault, TxOutcome, TxSubmitter};
use crate::error::{AppError, AppResult, ChainError};
use crate::ledger::models::SagaKind;

sol! {
    #[sol(rpc)]
    interface IOriginVault {
        event Deposit(address indexed user, uint256 amount, uint256 timestamp);
        event WithdrawRequested(address indexed user, uint256 shares, uint256 timestamp);
        event WithdrawCompleted(address indexed user, uint256 shares);

        function completeWithdraw(address user, uint256 shares) external;
        function getUserBalance(address user) external view returns (uint256);
    }
}

/// Origin vault client: event source for the watcher and target of the completion call
pub struct EvmOriginVault {
    provider: DynProvider,
    vault: Address,
    operator: Address,
    policy: ConfirmationPolicy,
}

impl EvmOriginVault {
    pub fn new(
        rpc_url: &str,
        vault: &str,
        operator_key: &str,
        policy: ConfirmationPolicy,
    ) -> AppResult<Self> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| AppError::Config(format!("origin_rpc_url {rpc_url}: {e}")))?;
        let vault = parse_address(vault)
            .map_err(|e| AppError::Config(format!("origin_vault_address: {e}")))?;
        let signer: PrivateKeySigner = operator_key
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("origin_operator_key: {e}")))?;
        let operator = signer.address();

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();

        info!("✅ Origin vault client ready: vault={} operator={}", vault, operator);

        Ok(Self {
            provider,
            vault,
            operator,
            policy,
        })
    }

    fn contract(&self) -> IOriginVault::IOriginVaultInstance<DynProvider> {
        IOriginVault::new(self.vault, self.provider.clone())
    }

    fn decode_receipt(&self, call: &OriginCall, receipt: &TransactionReceipt) -> Result<TxOutcome, ChainError> {
        let tx_hash = format_tx_hash(&receipt.transaction_hash);
        if !receipt.status() {
            warn!(%tx_hash, "{} reverted on-chain", call.operation());
            return Ok(TxOutcome::Reverted {
                tx_hash,
                reason: "execution reverted".to_string(),
            });
        }

        let amount = receipt
            .inner
            .logs()
            .iter()
            .filter(|log| log.address() == self.vault)
            .find_map(|log| completion_amount(call, log))
            .ok_or_else(|| ChainError::Decode(format!("{} effect event in {tx_hash}", call.operation())))??;

        Ok(TxOutcome::Landed(Landed {
            tx_hash,
            block_number: receipt.block_number.unwrap_or_default(),
            amount,
        }))
    }

    async fn fetch_logs(&self, signature: alloy::primitives::B256, from_block: u64, to_block: u64) -> Result<Vec<Log>, ChainError> {
        let filter = Filter::new()
            .address(self.vault)
            .event_signature(signature)
            .from_block(from_block)
            .to_block(to_block);

        self.provider.get_logs(&filter).await.map_err(rpc_error)
    }
}

fn completion_amount(call: &OriginCall, log: &Log) -> Option<Result<u128, ChainError>> {
    match call {
        OriginCall::CompleteWithdraw { user, shares } => {
            let event = IOriginVault::WithdrawCompleted::decode_log(log.as_ref()).ok()?;
            let matches = parse_address(user).map(|a| a == event.data.user).unwrap_or(false)
                && event.data.shares == U256::from(*shares);
            matches.then(|| to_amount(event.data.shares))
        }
    }
}

/// Decode a vault log into a request event. Logs without a block position (still pending) are skipped.
fn decode_origin_event(log: &Log) -> Option<Result<OriginEvent, ChainError>> {
    let tx_hash = log.transaction_hash?;
    let log_index = log.log_index?;
    let block_number = log.block_number?;

    let decoded = if let Ok(event) = IOriginVault::Deposit::decode_log(log.as_ref()) {
        (SagaKind::Deposit, event.data.user, event.data.amount, event.data.timestamp)
    } else if let Ok(event) = IOriginVault::WithdrawRequested::decode_log(log.as_ref()) {
        (SagaKind::Withdraw, event.data.user, event.data.shares, event.data.timestamp)
    } else {
        return None;
    };

    let (kind, user, amount, timestamp) = decoded;
    Some(to_amount(amount).map(|amount| OriginEvent {
        kind,
        user: user.to_checksum(None),
        amount,
        tx_hash: format_tx_hash(&tx_hash),
        log_index,
        block_number,
        timestamp: u64::try_from(timestamp).unwrap_or(u64::MAX),
    }))
}

#[async_trait]
impl TxSubmitter<OriginCall> for EvmOriginVault {
    async fn head_block(&self) -> Result<u64, ChainError> {
        self.provider.get_block_number().await.map_err(rpc_error)
    }

    async fn submit(&self, call: &OriginCall) -> Result<String, ChainError> {
        let sent = match call {
            OriginCall::CompleteWithdraw { user, shares } => {
                self.contract()
                    .completeWithdraw(parse_address(user)?, U256::from(*shares))
                    .send()
                    .await
            }
        };

        let pending = sent.map_err(|e| send_error(call.operation(), e))?;
        let tx_hash = format_tx_hash(pending.tx_hash());
        info!("📤 {} submitted: {}", call.operation(), tx_hash);
        Ok(tx_hash)
    }

    async fn await_outcome(&self, call: &OriginCall, tx_hash: &str) -> Result<TxOutcome, ChainError> {
        let hash = parse_tx_hash(tx_hash)?;
        match wait_for_confirmation(&self.provider, hash, &self.policy).await? {
            Some(receipt) => self.decode_receipt(call, &receipt),
            None => Ok(TxOutcome::InFlight {
                tx_hash: tx_hash.to_string(),
            }),
        }
    }

    async fn probe_outcome(
        &self,
        call: &OriginCall,
        tx_hash: Option<&str>,
        from_block: u64,
    ) -> Result<TxOutcome, ChainError> {
        if let Some(raw) = tx_hash {
            match lookup_tx(&self.provider, parse_tx_hash(raw)?, self.policy.confirmations).await? {
                TxLookup::Confirmed(receipt) => return self.decode_receipt(call, &receipt),
                TxLookup::Pending => {
                    return Ok(TxOutcome::InFlight {
                        tx_hash: raw.to_string(),
                    })
                }
                TxLookup::Unknown => {}
            }
        }

        let OriginCall::CompleteWithdraw { user, .. } = call;
        let filter = Filter::new()
            .address(self.vault)
            .event_signature(IOriginVault::WithdrawCompleted::SIGNATURE_HASH)
            .topic1(parse_address(user)?.into_word())
            .from_block(from_block);
        let logs = self.provider.get_logs(&filter).await.map_err(rpc_error)?;

        for log in logs {
            if let (Some(Ok(amount)), Some(hash)) = (completion_amount(call, &log), log.transaction_hash) {
                info!("🔎 Found {} effect for {} in {:#x}", call.operation(), user, hash);
                return Ok(TxOutcome::Landed(Landed {
                    tx_hash: format_tx_hash(&hash),
                    block_number: log.block_number.unwrap_or_default(),
                    amount,
                }));
            }
        }

        Ok(TxOutcome::NotFound)
    }
}

#[async_trait]
impl OriginVault for EvmOriginVault {
    async fn fetch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<OriginEvent>, ChainError> {
        let (deposits, withdrawals) = futures::future::try_join(
            self.fetch_logs(IOriginVault::Deposit::SIGNATURE_HASH, from_block, to_block),
            self.fetch_logs(IOriginVault::WithdrawRequested::SIGNATURE_HASH, from_block, to_block),
        )
        .await?;

        debug!(
            "Found {} Deposit and {} WithdrawRequested events in {}-{}",
            deposits.len(),
            withdrawals.len(),
            from_block,
            to_block
        );

        let mut events = Vec::with_capacity(deposits.len() + withdrawals.len());
        for log in deposits.iter().chain(withdrawals.iter()) {
            match decode_origin_event(log) {
                Some(Ok(event)) => events.push(event),
                Some(Err(e)) => warn!("Skipping undecodable vault event: {}", e),
                None => {}
            }
        }
        events.sort_by_key(|event| (event.block_number, event.log_index));
        Ok(events)
    }

    async fn user_balance(&self, user: &str) -> Result<u128, ChainError> {
        let balance = self
            .contract()
            .getUserBalance(parse_address(user)?)
            .call()
            .await
            .map_err(rpc_error)?;
        to_amount(balance)
    }

    fn vault_address(&self) -> String {
        self.vault.to_checksum(None)
    }

    fn operator_address(&self) -> String {
        self.operator.to_checksum(None)
    }
}
