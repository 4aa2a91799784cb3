#![allow(dead_code)]

use async_trait::async_trait;
use spigot_common::{Address, Hash, RpcError};
use spigot_faucet::{
    ChainClient, ChainSubmitter, DisbursementEngine, FaucetMetrics, FundingAccount, QuotaLedger,
    QuotaSettings, Reconciler, RetryConfig, SubmitterSettings, TxStatus,
};
use spigot_storage::{DurableStore, StoreConfig};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const FAUCET_KEY: &str = "0x4646464646464646464646464646464646464646464646464646464646464646";
pub const CHAIN_ID: u64 = 31337;

/// How the mock node answers the next `eth_sendRawTransaction`
#[derive(Debug, Clone)]
pub enum SendBehaviour {
    Accept,
    Reject(&'static str),
    /// Another sender took the nonce first
    StaleNonce,
    /// Connection refused, nothing delivered
    Unreachable,
    /// Accepted, but the response never arrives
    LoseResponse,
    /// Accepted, then answered as a duplicate of a pooled transaction
    AlreadyKnown,
}

/// What happens to accepted transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mining {
    Confirm,
    Revert,
    /// Stay in the pool until `mine_pending`
    Hold,
}

struct ChainState {
    script: VecDeque<SendBehaviour>,
    mining: Mining,
    pending_nonce: u64,
    confirmed_nonce: u64,
    block: u64,
    txs: HashMap<Hash, (u64, TxStatus)>,
    issued: Vec<u64>,
    send_calls: usize,
}

/// In-memory node for one funding account
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChainState {
                script: VecDeque::new(),
                mining: Mining::Confirm,
                pending_nonce: 0,
                confirmed_nonce: 0,
                block: 100,
                txs: HashMap::new(),
                issued: Vec::new(),
                send_calls: 0,
            }),
        })
    }

    pub fn script(&self, behaviours: impl IntoIterator<Item = SendBehaviour>) {
        self.state.lock().unwrap().script.extend(behaviours);
    }

    pub fn set_mining(&self, mining: Mining) {
        self.state.lock().unwrap().mining = mining;
    }

    /// Nonces of every transaction the node accepted, in order
    pub fn issued_nonces(&self) -> Vec<u64> {
        self.state.lock().unwrap().issued.clone()
    }

    pub fn send_calls(&self) -> usize {
        self.state.lock().unwrap().send_calls
    }

    /// Mine everything in the pool successfully
    pub fn mine_pending(&self) {
        let mut state = self.state.lock().unwrap();
        state.block += 1;
        let block = state.block;
        let mut highest = None;
        for (nonce, status) in state.txs.values_mut() {
            if *status == TxStatus::Unknown {
                *status = TxStatus::Confirmed { block_number: block };
                highest = highest.max(Some(*nonce));
            }
        }
        if let Some(nonce) = highest {
            state.confirmed_nonce = state.confirmed_nonce.max(nonce + 1);
        }
    }

    /// Evict everything in the pool, as a node restart would
    pub fn drop_pending(&self) {
        let mut state = self.state.lock().unwrap();
        state.txs.retain(|_, (_, status)| *status != TxStatus::Unknown);
        state.pending_nonce = state.confirmed_nonce;
    }

    /// Another signer of the same account lands a transaction at the next nonce
    pub fn external_transaction(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending_nonce += 1;
        state.confirmed_nonce = state.pending_nonce;
    }

    fn accept(state: &mut ChainState, nonce: u64, hash: Hash) {
        let status = match state.mining {
            Mining::Confirm => TxStatus::Confirmed { block_number: state.block },
            Mining::Revert => TxStatus::Reverted { block_number: state.block },
            Mining::Hold => TxStatus::Unknown,
        };
        if status != TxStatus::Unknown {
            state.confirmed_nonce = nonce + 1;
        }
        state.pending_nonce = nonce + 1;
        state.txs.insert(hash, (nonce, status));
        state.issued.push(nonce);
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        Ok(CHAIN_ID)
    }

    async fn next_sequence_number(&self, _: &Address) -> Result<u64, RpcError> {
        Ok(self.state.lock().unwrap().pending_nonce)
    }

    async fn confirmed_sequence_number(&self, _: &Address) -> Result<u64, RpcError> {
        Ok(self.state.lock().unwrap().confirmed_nonce)
    }

    async fn submit_raw_transaction(&self, raw: &[u8]) -> Result<Hash, RpcError> {
        let nonce: u64 = rlp::Rlp::new(raw)
            .val_at(0)
            .map_err(|e| RpcError::Decode(e.to_string()))?;
        let hash = Hash::keccak(raw);

        let mut state = self.state.lock().unwrap();
        state.send_calls += 1;
        let behaviour = state.script.pop_front().unwrap_or(SendBehaviour::Accept);

        let stale = || RpcError::Rpc {
            code: -32000,
            message: "nonce too low".to_string(),
        };

        match behaviour {
            SendBehaviour::Accept => {
                if nonce < state.pending_nonce {
                    return Err(stale());
                }
                Self::accept(&mut state, nonce, hash);
                Ok(hash)
            }
            SendBehaviour::Reject(message) => Err(RpcError::Rpc {
                code: -32000,
                message: message.to_string(),
            }),
            SendBehaviour::StaleNonce => {
                state.pending_nonce = state.pending_nonce.max(nonce + 1);
                state.confirmed_nonce = state.pending_nonce;
                Err(stale())
            }
            SendBehaviour::Unreachable => {
                Err(RpcError::Unreachable("connection refused".to_string()))
            }
            SendBehaviour::LoseResponse => {
                Self::accept(&mut state, nonce, hash);
                Err(RpcError::Transport("connection reset by peer".to_string()))
            }
            SendBehaviour::AlreadyKnown => {
                Self::accept(&mut state, nonce, hash);
                Err(RpcError::Rpc {
                    code: -32000,
                    message: "already known".to_string(),
                })
            }
        }
    }

    async fn transaction_status(&self, hash: &Hash) -> Result<TxStatus, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .txs
            .get(hash)
            .map(|(_, status)| *status)
            .unwrap_or(TxStatus::Unknown))
    }
}

pub fn limits(total: u128, address: u128, amount: u128) -> QuotaSettings {
    QuotaSettings {
        total_limit: total,
        address_limit: address,
        transfer_amount: amount,
    }
}

pub fn addr(byte: u8) -> Address {
    Address([byte; 20])
}

pub fn open_ledger(path: &Path, limits: QuotaSettings) -> Arc<QuotaLedger> {
    let store = DurableStore::open(StoreConfig {
        path: path.to_path_buf(),
        ..StoreConfig::default()
    })
    .unwrap();
    Arc::new(QuotaLedger::open(Arc::new(store), limits).unwrap())
}

fn settings() -> SubmitterSettings {
    SubmitterSettings {
        gas_price: 1_000_000_000,
        gas_limit: 21000,
        confirmation_timeout: Duration::from_millis(30),
        poll_interval: Duration::from_millis(5),
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter: false,
    }
}

/// A faucet wired to a mock chain over a temporary database
pub struct TestFaucet {
    pub chain: Arc<MockChain>,
    pub ledger: Arc<QuotaLedger>,
    pub submitter: Arc<ChainSubmitter>,
    pub metrics: Arc<FaucetMetrics>,
    pub engine: Arc<DisbursementEngine>,
    pub reconciler: Reconciler,
}

impl TestFaucet {
    pub async fn start(dir: &TempDir, limits: QuotaSettings) -> Self {
        Self::with_chain(dir, limits, MockChain::new()).await
    }

    pub async fn with_chain(dir: &TempDir, limits: QuotaSettings, chain: Arc<MockChain>) -> Self {
        let ledger = open_ledger(dir.path(), limits);
        let account = FundingAccount::from_hex(FAUCET_KEY).unwrap();
        let submitter = Arc::new(
            ChainSubmitter::connect(chain.clone(), account, settings())
                .await
                .unwrap(),
        );
        let metrics = Arc::new(FaucetMetrics::new().unwrap());
        let engine = Arc::new(DisbursementEngine::new(
            ledger.clone(),
            submitter.clone(),
            metrics.clone(),
            fast_retry(),
            0,
        ));
        let reconciler = Reconciler::new(ledger.clone(), submitter.clone(), metrics.clone());

        Self {
            chain,
            ledger,
            submitter,
            metrics,
            engine,
            reconciler,
        }
    }

    pub async fn fund(&self, address: &Address) -> spigot_faucet::FaucetResult<spigot_faucet::Disbursement> {
        self.engine.request_funds(&address.to_string()).await
    }
}
