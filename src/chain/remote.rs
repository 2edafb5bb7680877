use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log, TransactionReceipt};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;
use tracing::{info, warn};

use super::confirm::{
    format_tx_hash, lookup_tx, parse_tx_hash, rpc_error, send_error, wait_for_confirmation,
    ConfirmationPolicy, TxLookup,
};
use super::{parse_address, ChainCall, to_amount, Landed, RemoteCall, RemoteLedger, RemoteTotals, TxOutcome, TxSubmitter};
use crate::error::{AppError, AppResult, ChainError};

sol! {
    #[sol(rpc)]
    interface IYieldManager {
        event Supplied(address indexed beneficiary, uint256 assets, uint256 shares);
        event Redeemed(address indexed owner, address indexed receiver, uint256 shares, uint256 assets);
        event YieldTransferred(address indexed user, uint256 amount);

        function supply(uint256 amount, address beneficiary) external returns (uint256 shares);
        function redeem(uint256 shares, address receiver, address owner) external returns (uint256 assets);
        function transferYield(address user, uint256 amount) external;

        function availableBalance() external view returns (uint256);
        function userYield(address user) external view returns (uint256);
        function userShares(address user) external view returns (uint256);
        function totalSupplied() external view returns (uint256);
        function totalAssets() external view returns (uint256);
    }
}

/// Remote yield manager client over JSON-RPC
pub struct EvmRemoteLedger {
    provider: DynProvider,
    manager: Address,
    operator: Address,
    policy: ConfirmationPolicy,
}

impl EvmRemoteLedger {
    pub fn new(
        rpc_url: &str,
        manager: &str,
        operator_key: &str,
        policy: ConfirmationPolicy,
    ) -> AppResult<Self> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| AppError::Config(format!("remote_rpc_url {rpc_url}: {e}")))?;
        let manager = parse_address(manager)
            .map_err(|e| AppError::Config(format!("remote_manager_address: {e}")))?;
        let signer: PrivateKeySigner = operator_key
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("remote_operator_key: {e}")))?;
        let operator = signer.address();

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();

        info!("✅ Remote manager client ready: manager={} operator={}", manager, operator);

        Ok(Self {
            provider,
            manager,
            operator,
            policy,
        })
    }

    fn contract(&self) -> IYieldManager::IYieldManagerInstance<DynProvider> {
        IYieldManager::new(self.manager, self.provider.clone())
    }

    /// Decode a mined receipt into the call's result
    fn decode_receipt(&self, call: &RemoteCall, receipt: &TransactionReceipt) -> Result<TxOutcome, ChainError> {
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
            .filter(|log| log.address() == self.manager)
            .find_map(|log| effect_amount(call, log))
            .ok_or_else(|| ChainError::Decode(format!("{} effect event in {tx_hash}", call.operation())))??;

        Ok(TxOutcome::Landed(Landed {
            tx_hash,
            block_number: receipt.block_number.unwrap_or_default(),
            amount,
        }))
    }

    /// Find the call's effect event emitted at or after `from_block`
    async fn scan_effect(&self, call: &RemoteCall, from_block: u64) -> Result<TxOutcome, ChainError> {
        let (signature, subject) = match call {
            RemoteCall::Supply { beneficiary, .. } => {
                (IYieldManager::Supplied::SIGNATURE_HASH, parse_address(beneficiary)?)
            }
            RemoteCall::Redeem { owner, .. } => {
                (IYieldManager::Redeemed::SIGNATURE_HASH, parse_address(owner)?)
            }
            RemoteCall::TransferYield { user, .. } => {
                (IYieldManager::YieldTransferred::SIGNATURE_HASH, parse_address(user)?)
            }
        };

        let filter = Filter::new()
            .address(self.manager)
            .event_signature(signature)
            .topic1(subject.into_word())
            .from_block(from_block);

        let logs = self.provider.get_logs(&filter).await.map_err(rpc_error)?;

        for log in logs {
            let Some(Ok(amount)) = effect_amount(call, &log) else {
                continue;
            };
            let Some(hash) = log.transaction_hash else {
                continue;
            };
            info!(
                "🔎 Found {} effect for {:?} in {:#x}",
                call.operation(),
                subject,
                hash
            );
            return Ok(TxOutcome::Landed(Landed {
                tx_hash: format_tx_hash(&hash),
                block_number: log.block_number.unwrap_or_default(),
                amount,
            }));
        }

        Ok(TxOutcome::NotFound)
    }
}

/// If `log` is the effect of `call`, the call's result amount.
/// `Some(Err)` when the event matches but the amount does not fit.
fn effect_amount(call: &RemoteCall, log: &Log) -> Option<Result<u128, ChainError>> {
    match call {
        RemoteCall::Supply { beneficiary, amount } => {
            let event = IYieldManager::Supplied::decode_log(log.as_ref()).ok()?;
            let matches = address_matches(beneficiary, event.data.beneficiary)
                && event.data.assets == U256::from(*amount);
            matches.then(|| to_amount(event.data.shares))
        }
        RemoteCall::Redeem { owner, shares } => {
            let event = IYieldManager::Redeemed::decode_log(log.as_ref()).ok()?;
            let matches = address_matches(owner, event.data.owner)
                && event.data.shares == U256::from(*shares);
            matches.then(|| to_amount(event.data.assets))
        }
        RemoteCall::TransferYield { user, amount } => {
            let event = IYieldManager::YieldTransferred::decode_log(log.as_ref()).ok()?;
            let matches = address_matches(user, event.data.user)
                && event.data.amount == U256::from(*amount);
            matches.then(|| to_amount(event.data.amount))
        }
    }
}

fn address_matches(expected: &str, actual: Address) -> bool {
    parse_address(expected).map(|a| a == actual).unwrap_or(false)
}

#[async_trait]
impl TxSubmitter<RemoteCall> for EvmRemoteLedger {
    async fn head_block(&self) -> Result<u64, ChainError> {
        self.provider.get_block_number().await.map_err(rpc_error)
    }

    async fn submit(&self, call: &RemoteCall) -> Result<String, ChainError> {
        let manager = self.contract();
        let sent = match call {
            RemoteCall::Supply { beneficiary, amount } => {
                manager
                    .supply(U256::from(*amount), parse_address(beneficiary)?)
                    .send()
                    .await
            }
            RemoteCall::Redeem { owner, shares } => {
                // proceeds stay in manager custody so principal and yield can be split
                manager
                    .redeem(U256::from(*shares), self.manager, parse_address(owner)?)
                    .send()
                    .await
            }
            RemoteCall::TransferYield { user, amount } => {
                manager
                    .transferYield(parse_address(user)?, U256::from(*amount))
                    .send()
                    .await
            }
        };

        let pending = sent.map_err(|e| send_error(call.operation(), e))?;
        let tx_hash = format_tx_hash(pending.tx_hash());
        info!("📤 {} submitted: {}", call.operation(), tx_hash);
        Ok(tx_hash)
    }

    async fn await_outcome(&self, call: &RemoteCall, tx_hash: &str) -> Result<TxOutcome, ChainError> {
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
        call: &RemoteCall,
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

        self.scan_effect(call, from_block).await
    }
}

#[async_trait]
impl RemoteLedger for EvmRemoteLedger {
    async fn available_balance(&self) -> Result<u128, ChainError> {
        let balance = self.contract().availableBalance().call().await.map_err(rpc_error)?;
        to_amount(balance)
    }

    async fn user_yield(&self, user: &str) -> Result<u128, ChainError> {
        let value = self
            .contract()
            .userYield(parse_address(user)?)
            .call()
            .await
            .map_err(rpc_error)?;
        to_amount(value)
    }

    async fn user_shares(&self, user: &str) -> Result<u128, ChainError> {
        let value = self
            .contract()
            .userShares(parse_address(user)?)
            .call()
            .await
            .map_err(rpc_error)?;
        to_amount(value)
    }

    async fn totals(&self) -> Result<RemoteTotals, ChainError> {
        let manager = self.contract();
        let supplied = manager.totalSupplied().call().await.map_err(rpc_error)?;
        let assets = manager.totalAssets().call().await.map_err(rpc_error)?;

        Ok(RemoteTotals {
            total_supplied: to_amount(supplied)?,
            total_assets: to_amount(assets)?,
        })
    }

    fn manager_address(&self) -> String {
        self.manager.to_checksum(None)
    }

    fn operator_address(&self) -> String {
        self.operator.to_checksum(None)
    }
}
