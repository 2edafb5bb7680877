//! Scripted chain, oracle and harness for driving the coordinator in tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use super::retry::RetryPolicy;
use super::{CoordinatorSettings, SagaCoordinator};
use crate::chain::{
    ChainCall, Landed, OriginCall, OriginEvent, OriginVault, RemoteCall, RemoteLedger,
    RemoteTotals, TxOutcome, TxSubmitter,
};
use crate::error::{ChainError, OracleError};
use crate::ledger::memory::MemoryLedger;
use crate::ledger::models::{SagaKind, SagaRecord, UserPosition};
use crate::ledger::LedgerStore;
use crate::oracle::{PriceOracle, PriceQuote};

pub const ALICE: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
pub const BOB: &str = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359";

/// Ordered record of every broadcast across both chains, e.g. `remote:supply`
pub type Journal = Arc<Mutex<Vec<String>>>;

/// What goes wrong with the next submitted call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Rejected during gas estimation; nothing broadcast
    RejectOnSend,
    /// Transport failure on send; nothing broadcast
    SendFails,
    /// Mined and reverted
    MinedRevert,
    /// Lands on chain but the confirmation wait times out
    LostConfirmation,
    /// Broadcast, then dropped from the mempool; never lands
    Dropped,
    /// Sits in the mempool; every wait and probe reports it in flight
    Stuck,
}

struct ChainState<C> {
    head: u64,
    nonce: u64,
    faults: HashMap<&'static str, VecDeque<Fault>>,
    effects: Vec<(C, Landed)>,
    receipts: HashMap<String, TxOutcome>,
    unconfirmed: HashSet<String>,
    broadcasts: Vec<C>,
}

/// One scripted ledger: blocks advance one per broadcast
pub struct MockChain<C> {
    name: &'static str,
    state: Mutex<ChainState<C>>,
    journal: Journal,
}

impl<C: ChainCall + Clone + PartialEq> MockChain<C> {
    fn new(name: &'static str, journal: Journal) -> Self {
        Self {
            name,
            state: Mutex::new(ChainState {
                head: 100,
                nonce: 0,
                faults: HashMap::new(),
                effects: Vec::new(),
                receipts: HashMap::new(),
                unconfirmed: HashSet::new(),
                broadcasts: Vec::new(),
            }),
            journal,
        }
    }

    /// Script a fault for the next broadcast of `operation`
    pub fn fail_next(&self, operation: &'static str, fault: Fault) {
        self.state
            .lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(fault);
    }

    /// Calls that reached the chain (rejected sends excluded)
    pub fn broadcasts(&self) -> Vec<C> {
        self.state.lock().broadcasts.clone()
    }

    pub fn head(&self) -> u64 {
        self.state.lock().head
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().head = head;
    }

    fn submit_with(&self, call: &C, amount: u128) -> Result<String, ChainError> {
        let mut state = self.state.lock();
        let fault = state
            .faults
            .get_mut(call.operation())
            .and_then(VecDeque::pop_front);
        match fault {
            Some(Fault::RejectOnSend) => {
                return Err(ChainError::Reverted {
                    operation: call.operation().to_string(),
                    reason: "execution reverted: mock".to_string(),
                })
            }
            Some(Fault::SendFails) => return Err(ChainError::Rpc("connection reset".to_string())),
            _ => {}
        }

        state.nonce += 1;
        state.head += 1;
        let tx_hash = format!("0x{}{:060x}", if self.name == "remote" { "aaaa" } else { "bbbb" }, state.nonce);
        let block_number = state.head;
        state.broadcasts.push(call.clone());
        self.journal
            .lock()
            .push(format!("{}:{}", self.name, call.operation()));

        match fault {
            Some(Fault::MinedRevert) => {
                state.receipts.insert(
                    tx_hash.clone(),
                    TxOutcome::Reverted {
                        tx_hash: tx_hash.clone(),
                        reason: "execution reverted".to_string(),
                    },
                );
            }
            Some(Fault::Dropped) => {
                state.unconfirmed.insert(tx_hash.clone());
            }
            Some(Fault::Stuck) => {
                state.unconfirmed.insert(tx_hash.clone());
                state.receipts.insert(
                    tx_hash.clone(),
                    TxOutcome::InFlight {
                        tx_hash: tx_hash.clone(),
                    },
                );
            }
            _ => {
                let landed = Landed {
                    tx_hash: tx_hash.clone(),
                    block_number,
                    amount,
                };
                state.effects.push((call.clone(), landed.clone()));
                state.receipts.insert(tx_hash.clone(), TxOutcome::Landed(landed));
                if fault == Some(Fault::LostConfirmation) {
                    state.unconfirmed.insert(tx_hash.clone());
                }
            }
        }
        Ok(tx_hash)
    }

    fn await_with(&self, tx_hash: &str) -> TxOutcome {
        let state = self.state.lock();
        if state.unconfirmed.contains(tx_hash) {
            return TxOutcome::InFlight {
                tx_hash: tx_hash.to_string(),
            };
        }
        state
            .receipts
            .get(tx_hash)
            .cloned()
            .unwrap_or_else(|| TxOutcome::InFlight {
                tx_hash: tx_hash.to_string(),
            })
    }

    fn probe_with(&self, call: &C, tx_hash: Option<&str>, from_block: u64) -> TxOutcome {
        let state = self.state.lock();
        if let Some(outcome) = tx_hash.and_then(|hash| state.receipts.get(hash)) {
            return outcome.clone();
        }
        state
            .effects
            .iter()
            .find(|(effect, landed)| effect == call && landed.block_number >= from_block)
            .map(|(_, landed)| TxOutcome::Landed(landed.clone()))
            .unwrap_or(TxOutcome::NotFound)
    }
}

pub struct MockRemote {
    pub chain: MockChain<RemoteCall>,
    available: Mutex<u128>,
    redeem_assets: Mutex<HashMap<String, u128>>,
    totals: Mutex<RemoteTotals>,
    pub balance_checks: AtomicUsize,
}

impl MockRemote {
    pub fn new(journal: Journal) -> Self {
        Self {
            chain: MockChain::new("remote", journal),
            available: Mutex::new(1_000_000_000000),
            redeem_assets: Mutex::new(HashMap::new()),
            totals: Mutex::new(RemoteTotals::default()),
            balance_checks: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: u128) {
        *self.available.lock() = available;
    }

    /// Assets a redeem by `owner` returns; defaults to one asset per share
    pub fn set_redeem_assets(&self, owner: &str, assets: u128) {
        self.redeem_assets.lock().insert(owner.to_string(), assets);
    }

    pub fn set_totals(&self, totals: RemoteTotals) {
        *self.totals.lock() = totals;
    }

    pub fn count(&self, operation: &str) -> usize {
        self.chain
            .broadcasts()
            .iter()
            .filter(|call| call.operation() == operation)
            .count()
    }
}

#[async_trait]
impl TxSubmitter<RemoteCall> for MockRemote {
    async fn head_block(&self) -> Result<u64, ChainError> {
        Ok(self.chain.head())
    }

    async fn submit(&self, call: &RemoteCall) -> Result<String, ChainError> {
        let amount = match call {
            RemoteCall::Supply { amount, .. } => *amount,
            RemoteCall::Redeem { owner, shares } => self
                .redeem_assets
                .lock()
                .get(owner)
                .copied()
                .unwrap_or(*shares),
            RemoteCall::TransferYield { amount, .. } => *amount,
        };
        self.chain.submit_with(call, amount)
    }

    async fn await_outcome(&self, _call: &RemoteCall, tx_hash: &str) -> Result<TxOutcome, ChainError> {
        Ok(self.chain.await_with(tx_hash))
    }

    async fn probe_outcome(
        &self,
        call: &RemoteCall,
        tx_hash: Option<&str>,
        from_block: u64,
    ) -> Result<TxOutcome, ChainError> {
        Ok(self.chain.probe_with(call, tx_hash, from_block))
    }
}

#[async_trait]
impl RemoteLedger for MockRemote {
    async fn available_balance(&self) -> Result<u128, ChainError> {
        self.balance_checks.fetch_add(1, Ordering::SeqCst);
        Ok(*self.available.lock())
    }

    async fn user_yield(&self, _user: &str) -> Result<u128, ChainError> {
        Ok(0)
    }

    async fn user_shares(&self, _user: &str) -> Result<u128, ChainError> {
        Ok(0)
    }

    async fn totals(&self) -> Result<RemoteTotals, ChainError> {
        Ok(self.totals.lock().clone())
    }

    fn manager_address(&self) -> String {
        "0x00000000000000000000000000000000000000Aa".to_string()
    }

    fn operator_address(&self) -> String {
        "0x00000000000000000000000000000000000000cc".to_string()
    }
}

pub struct MockOrigin {
    pub chain: MockChain<OriginCall>,
    events: Mutex<Vec<OriginEvent>>,
    balances: Mutex<HashMap<String, u128>>,
    fetches: Mutex<Vec<(u64, u64)>>,
    fail_fetch: AtomicBool,
}

impl MockOrigin {
    pub fn new(journal: Journal) -> Self {
        Self {
            chain: MockChain::new("origin", journal),
            events: Mutex::new(Vec::new()),
            balances: Mutex::new(HashMap::new()),
            fetches: Mutex::new(Vec::new()),
            fail_fetch: AtomicBool::new(false),
        }
    }

    pub fn push_event(&self, event: OriginEvent) {
        self.events.lock().push(event);
    }

    pub fn set_balance(&self, user: &str, balance: u128) {
        self.balances.lock().insert(user.to_string(), balance);
    }

    /// Block ranges requested so far
    pub fn fetches(&self) -> Vec<(u64, u64)> {
        self.fetches.lock().clone()
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn count(&self, operation: &str) -> usize {
        self.chain
            .broadcasts()
            .iter()
            .filter(|call| call.operation() == operation)
            .count()
    }
}

#[async_trait]
impl TxSubmitter<OriginCall> for MockOrigin {
    async fn head_block(&self) -> Result<u64, ChainError> {
        Ok(self.chain.head())
    }

    async fn submit(&self, call: &OriginCall) -> Result<String, ChainError> {
        let OriginCall::CompleteWithdraw { shares, .. } = call;
        self.chain.submit_with(call, *shares)
    }

    async fn await_outcome(&self, _call: &OriginCall, tx_hash: &str) -> Result<TxOutcome, ChainError> {
        Ok(self.chain.await_with(tx_hash))
    }

    async fn probe_outcome(
        &self,
        call: &OriginCall,
        tx_hash: Option<&str>,
        from_block: u64,
    ) -> Result<TxOutcome, ChainError> {
        Ok(self.chain.probe_with(call, tx_hash, from_block))
    }
}

#[async_trait]
impl OriginVault for MockOrigin {
    async fn fetch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<OriginEvent>, ChainError> {
        self.fetches.lock().push((from_block, to_block));
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ChainError::Rpc("origin node unreachable".to_string()));
        }
        let mut events: Vec<OriginEvent> = self
            .events
            .lock()
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn user_balance(&self, user: &str) -> Result<u128, ChainError> {
        Ok(self.balances.lock().get(user).copied().unwrap_or(0))
    }

    fn vault_address(&self) -> String {
        "0x00000000000000000000000000000000000000bB".to_string()
    }

    fn operator_address(&self) -> String {
        "0x00000000000000000000000000000000000000cc".to_string()
    }
}

/// Oracle returning whatever the test last configured
pub struct MockOracle {
    next: Mutex<Result<PriceQuote, OracleError>>,
    pub calls: AtomicUsize,
}

impl MockOracle {
    pub fn fixed(price: Decimal) -> Self {
        Self {
            next: Mutex::new(Ok(quote(price, false))),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_price(&self, price: Decimal) {
        *self.next.lock() = Ok(quote(price, false));
    }

    pub fn set_stale(&self, price: Decimal) {
        *self.next.lock() = Ok(quote(price, true));
    }

    pub fn set_unavailable(&self) {
        *self.next.lock() = Err(OracleError::Unavailable("feed offline".to_string()));
    }
}

fn quote(price: Decimal, stale: bool) -> PriceQuote {
    let observed_at = if stale {
        Utc::now() - Duration::seconds(900)
    } else {
        Utc::now()
    };
    PriceQuote {
        symbol: "XRP".to_string(),
        price_usd: price,
        decimals: 5,
        observed_at,
        stale,
    }
}

#[async_trait]
impl PriceOracle for MockOracle {
    async fn quote(&self, _symbol: &str) -> Result<PriceQuote, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.next.lock().clone()
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

pub fn origin_event(kind: SagaKind, user: &str, amount: u128, block_number: u64, log_index: u64) -> OriginEvent {
    OriginEvent {
        kind,
        user: user.to_string(),
        amount,
        tx_hash: format!("0x{:064x}", block_number * 1_000 + log_index),
        log_index,
        block_number,
        timestamp: 1_700_000_000 + block_number,
    }
}

pub fn test_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        oracle_symbol: "XRP".to_string(),
        asset_decimals: 6,
        settlement_decimals: 6,
        reject_stale_quotes: true,
        fallback_rate: None,
        max_workers: 4,
        // zero backoff: a failed saga is due again as soon as the sweep runs
        retry: RetryPolicy {
            base_ms: 0,
            max_ms: 0,
            max_attempts: 5,
        },
    }
}

/// Coordinator wired to in-memory doubles
pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub oracle: Arc<MockOracle>,
    pub remote: Arc<MockRemote>,
    pub origin: Arc<MockOrigin>,
    pub journal: Journal,
    pub coordinator: Arc<SagaCoordinator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: CoordinatorSettings) -> Self {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let ledger = Arc::new(MemoryLedger::new());
        let oracle = Arc::new(MockOracle::fixed(Decimal::new(102, 2)));
        let remote = Arc::new(MockRemote::new(journal.clone()));
        let origin = Arc::new(MockOrigin::new(journal.clone()));

        let coordinator = SagaCoordinator::new(
            ledger.clone(),
            oracle.clone(),
            remote.clone(),
            origin.clone(),
            settings,
        );

        Self {
            ledger,
            oracle,
            remote,
            origin,
            journal,
            coordinator,
        }
    }

    pub async fn saga(&self, id: &str) -> SagaRecord {
        self.ledger.get_saga(id).await.unwrap().unwrap()
    }

    pub async fn position(&self, address: &str) -> Option<UserPosition> {
        self.ledger.get_position(address).await.unwrap()
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    /// Run one sweep and wait for the lanes it woke
    pub async fn sweep(&self) {
        self.coordinator.sweep().await.unwrap();
        self.coordinator.wait_idle().await;
    }
}
