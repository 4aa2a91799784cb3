//! Chain submitter
//!
//! Owns the funding account and its sequence number. Every submission runs
//! under one async mutex from nonce acquisition through confirmation, so the
//! account never has two faucet transactions in flight.

use serde::Serialize;
use spigot_common::{Address, Hash, RpcError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, Confirmation, TxStatus};
use crate::config::FaucetConfig;
use crate::error::FaucetError;
use crate::ledger::SubmissionRef;
use crate::transaction::{FundingAccount, TransferTx};

/// Node messages meaning the nonce we used is already taken
const STALE_NONCE_MARKERS: [&str; 2] = ["nonce too low", "replacement transaction underpriced"];

/// Node messages meaning this exact transaction is already in its pool
const ALREADY_KNOWN_MARKERS: [&str; 2] = ["already known", "known transaction"];

/// Durable record of a signed transaction, written before it is sent
pub trait SubmissionJournal: Send + Sync {
    fn record_signed(&self, submission: SubmissionRef) -> Result<(), FaucetError>;
}

/// A transfer that landed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub tx_hash: Hash,
    pub nonce: u64,
    pub block_number: u64,
    pub destination: Address,
    pub amount: u128,
}

/// A transfer whose outcome is not yet known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingTransfer {
    pub tx_hash: Hash,
    pub nonce: u64,
    pub destination: Address,
    pub amount: u128,
}

impl PendingTransfer {
    pub fn submission(&self) -> SubmissionRef {
        SubmissionRef {
            nonce: self.nonce,
            tx_hash: self.tx_hash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Confirmed(Receipt),
    /// Accepted or possibly accepted, but no receipt within the timeout
    Pending(PendingTransfer),
}

#[derive(Error, Debug)]
pub enum SubmissionError {
    /// The node refused the transaction or it reverted
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// Nothing reached the node
    #[error("node unreachable: {reason}")]
    Unreachable {
        reason: String,
        /// Transaction journaled before the failed send, if any
        journaled: Option<SubmissionRef>,
    },

    /// Failed locally before anything was sent
    #[error(transparent)]
    Aborted(#[from] FaucetError),
}

/// Gas and confirmation parameters
#[derive(Debug, Clone, Copy)]
pub struct SubmitterSettings {
    pub gas_price: u64,
    pub gas_limit: u64,
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
}

impl SubmitterSettings {
    pub fn from_config(config: &FaucetConfig) -> Self {
        Self {
            gas_price: config.gas_price,
            gas_limit: config.gas_limit,
            confirmation_timeout: config.confirmation_timeout(),
            poll_interval: config.confirmation_poll_interval(),
        }
    }
}

pub struct ChainSubmitter {
    client: Arc<dyn ChainClient>,
    account: FundingAccount,
    chain_id: u64,
    settings: SubmitterSettings,
    /// Next nonce to use; `None` until fetched or after invalidation
    sequence: Mutex<Option<u64>>,
}

impl ChainSubmitter {
    pub fn new(
        client: Arc<dyn ChainClient>,
        account: FundingAccount,
        chain_id: u64,
        settings: SubmitterSettings,
    ) -> Self {
        Self {
            client,
            account,
            chain_id,
            settings,
            sequence: Mutex::new(None),
        }
    }

    /// Build a submitter, fetching the chain id from the node
    pub async fn connect(
        client: Arc<dyn ChainClient>,
        account: FundingAccount,
        settings: SubmitterSettings,
    ) -> Result<Self, RpcError> {
        let chain_id = client.chain_id().await?;
        info!("Connected to chain {}, faucet address {}", chain_id, account.address());
        Ok(Self::new(client, account, chain_id, settings))
    }

    pub fn address(&self) -> Address {
        self.account.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    pub async fn cached_sequence(&self) -> Option<u64> {
        *self.sequence.lock().await
    }

    /// Forget the cached nonce; the next submission refetches it
    pub async fn invalidate_sequence(&self) {
        let mut sequence = self.sequence.lock().await;
        if let Some(stale) = sequence.take() {
            debug!("Dropped cached nonce {}", stale);
        }
    }

    /// Sign, journal, send and await one transfer
    pub async fn submit(
        &self,
        destination: &Address,
        amount: u128,
        journal: &dyn SubmissionJournal,
    ) -> Result<SubmitOutcome, SubmissionError> {
        let mut sequence = self.sequence.lock().await;
        let mut refetched = false;

        let pending = loop {
            let nonce = match *sequence {
                Some(nonce) => nonce,
                None => {
                    let nonce = self
                        .client
                        .next_sequence_number(&self.account.address())
                        .await
                        .map_err(|e| SubmissionError::Unreachable {
                            reason: e.to_string(),
                            journaled: None,
                        })?;
                    *sequence = Some(nonce);
                    nonce
                }
            };

            let signed = self.account.sign(&TransferTx {
                nonce,
                gas_price: self.settings.gas_price,
                gas_limit: self.settings.gas_limit,
                to: *destination,
                value: amount,
                chain_id: self.chain_id,
            })?;
            let submission = SubmissionRef {
                nonce,
                tx_hash: signed.hash,
            };
            journal.record_signed(submission)?;

            let pending = PendingTransfer {
                tx_hash: signed.hash,
                nonce,
                destination: *destination,
                amount,
            };

            match self.client.submit_raw_transaction(&signed.raw).await {
                Ok(reported) => {
                    if reported != signed.hash {
                        warn!("Node reported hash {} for transaction {}", reported, signed.hash);
                    }
                    *sequence = Some(nonce + 1);
                    debug!("Transaction {} accepted with nonce {}", signed.hash, nonce);
                    break pending;
                }
                Err(RpcError::Unreachable(reason)) => {
                    return Err(SubmissionError::Unreachable {
                        reason,
                        journaled: Some(submission),
                    });
                }
                Err(RpcError::Rpc { message, .. }) if is_already_known(&message) => {
                    // the pool holds this very hash, so it is live at this nonce
                    *sequence = Some(nonce + 1);
                    debug!("Transaction {} already known to the node", signed.hash);
                    break pending;
                }
                Err(RpcError::Rpc { message, .. }) if is_stale_nonce(&message) => {
                    *sequence = None;
                    if refetched {
                        return Err(SubmissionError::Rejected(message));
                    }
                    warn!("Nonce {} is stale ({}), refetching", nonce, message);
                    refetched = true;
                }
                Err(RpcError::Rpc { message, .. }) => {
                    return Err(SubmissionError::Rejected(message));
                }
                Err(e) => {
                    // the request may have been delivered before the failure
                    warn!("Outcome of transaction {} unknown: {}", signed.hash, e);
                    *sequence = None;
                    return Ok(SubmitOutcome::Pending(pending));
                }
            }
        };

        let confirmation = self
            .client
            .await_confirmation(
                &pending.tx_hash,
                self.settings.confirmation_timeout,
                self.settings.poll_interval,
            )
            .await;

        match confirmation {
            Ok(Confirmation::Mined(TxStatus::Confirmed { block_number })) => {
                Ok(SubmitOutcome::Confirmed(Receipt {
                    tx_hash: pending.tx_hash,
                    nonce: pending.nonce,
                    block_number,
                    destination: pending.destination,
                    amount: pending.amount,
                }))
            }
            Ok(Confirmation::Mined(TxStatus::Reverted { block_number })) => Err(
                SubmissionError::Rejected(format!("reverted in block {}", block_number)),
            ),
            Ok(Confirmation::Mined(TxStatus::Unknown)) | Ok(Confirmation::TimedOut) => {
                debug!("No receipt for {} yet", pending.tx_hash);
                Ok(SubmitOutcome::Pending(pending))
            }
            Err(e) => {
                warn!("Confirmation wait for {} failed: {}", pending.tx_hash, e);
                Ok(SubmitOutcome::Pending(pending))
            }
        }
    }
}

impl std::fmt::Debug for ChainSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainSubmitter")
            .field("account", &self.account)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

fn is_stale_nonce(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    STALE_NONCE_MARKERS.iter().any(|marker| message.contains(marker))
}

fn is_already_known(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ALREADY_KNOWN_MARKERS.iter().any(|marker| message.contains(marker))
}
