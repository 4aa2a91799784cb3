//! Disbursement engine
//!
//! Drives one funding request through validation, reservation, submission
//! and settlement. Each request runs in its own task so a dropped HTTP
//! connection never interrupts a transfer that is already under way.

use spigot_common::Address;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{FaucetError, FaucetResult};
use crate::ledger::{QuotaLedger, ReservationToken, SubmissionRef};
use crate::metrics::FaucetMetrics;
use crate::retry::RetryConfig;
use crate::submitter::{
    ChainSubmitter, PendingTransfer, Receipt, SubmissionError, SubmissionJournal, SubmitOutcome,
};

/// Result of a request that was not refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disbursement {
    /// The transfer landed and the quota is final
    Committed(Receipt),
    /// Sent, outcome unknown; the quota stays held until reconciled
    Pending(PendingTransfer),
}

impl Disbursement {
    pub fn is_pending(&self) -> bool {
        matches!(self, Disbursement::Pending(_))
    }
}

/// Writes submissions into the reservation journal
struct LedgerJournal<'a> {
    ledger: &'a QuotaLedger,
    token: ReservationToken,
}

impl SubmissionJournal for LedgerJournal<'_> {
    fn record_signed(&self, submission: SubmissionRef) -> Result<(), FaucetError> {
        self.ledger.record_submission(&self.token, submission)?;
        Ok(())
    }
}

pub struct DisbursementEngine {
    ledger: Arc<QuotaLedger>,
    submitter: Arc<ChainSubmitter>,
    metrics: Arc<FaucetMetrics>,
    retry: RetryConfig,
    decimals: u32,
}

impl DisbursementEngine {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        submitter: Arc<ChainSubmitter>,
        metrics: Arc<FaucetMetrics>,
        retry: RetryConfig,
        decimals: u32,
    ) -> Self {
        Self {
            ledger,
            submitter,
            metrics,
            retry,
            decimals,
        }
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn submitter(&self) -> &Arc<ChainSubmitter> {
        &self.submitter
    }

    pub fn metrics(&self) -> &Arc<FaucetMetrics> {
        &self.metrics
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    /// Parse and vet a destination. No side effects.
    pub fn validate(&self, raw: &str) -> FaucetResult<Address> {
        let address: Address = raw
            .trim()
            .parse()
            .map_err(|e| FaucetError::InvalidAddress(format!("{}", e)))?;
        if address.is_zero() {
            return Err(FaucetError::InvalidAddress("zero address not allowed".to_string()));
        }
        if address == self.submitter.address() {
            return Err(FaucetError::InvalidAddress(
                "cannot send to the faucet address".to_string(),
            ));
        }
        Ok(address)
    }

    /// Handle one funding request end to end
    pub async fn request_funds(self: &Arc<Self>, raw_address: &str) -> FaucetResult<Disbursement> {
        let result = match self.validate(raw_address) {
            Ok(address) => {
                let engine = Arc::clone(self);
                tokio::spawn(async move { engine.disburse(address).await })
                    .await
                    .unwrap_or_else(|e| {
                        Err(FaucetError::InternalError(format!("disbursement task failed: {}", e)))
                    })
            }
            Err(e) => Err(e),
        };

        self.metrics.record_outcome(&result, Disbursement::is_pending);
        if let Ok(total) = self.ledger.global_total() {
            self.metrics.set_global_total(total, self.decimals);
        }
        result
    }

    async fn disburse(&self, address: Address) -> FaucetResult<Disbursement> {
        let amount = self.ledger.limits().transfer_amount;
        let token = self.ledger.try_reserve(&address, amount).map_err(|e| {
            if let FaucetError::QuotaDenied(limit) = &e {
                info!("Request for {} denied: {}", address, limit);
            }
            e
        })?;
        debug!("Reservation {} held for {}", token.id, address);

        let journal = LedgerJournal {
            ledger: &self.ledger,
            token,
        };
        let timer = self.metrics.start_submission();
        let mut journaled: Option<SubmissionRef> = None;
        let mut attempt = 0;

        let outcome = loop {
            match self.submitter.submit(&address, amount, &journal).await {
                Err(SubmissionError::Unreachable {
                    reason,
                    journaled: sent,
                }) => {
                    journaled = sent.or(journaled);
                    match self.retry.delay_for(attempt) {
                        Some(delay) => {
                            warn!(
                                "Node unreachable for reservation {} ({}), retrying in {:?}",
                                token.id, reason, delay
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => break Err(SubmissionError::Unreachable { reason, journaled }),
                    }
                }
                other => break other,
            }
        };
        timer.finish();

        match outcome {
            Ok(SubmitOutcome::Confirmed(receipt)) => {
                if let Err(e) = self.ledger.commit(&token) {
                    error!(
                        "Reservation {} confirmed as {} but could not be committed: {}",
                        token.id, receipt.tx_hash, e
                    );
                    return Err(e);
                }
                info!(
                    "Sent {} to {} in {} (nonce {}, block {})",
                    amount, address, receipt.tx_hash, receipt.nonce, receipt.block_number
                );
                Ok(Disbursement::Committed(receipt))
            }
            Ok(SubmitOutcome::Pending(pending)) => {
                if let Err(e) = self.ledger.park(&token) {
                    error!(
                        "Reservation {} pending as {} but could not be parked: {}",
                        token.id, pending.tx_hash, e
                    );
                    return Err(e);
                }
                self.metrics.unresolved_reservations.inc();
                warn!(
                    "Transfer to {} pending as {} (nonce {}); reservation {} parked",
                    address, pending.tx_hash, pending.nonce, token.id
                );
                Ok(Disbursement::Pending(pending))
            }
            Err(SubmissionError::Rejected(reason)) => {
                self.ledger.release(&token)?;
                warn!("Transfer to {} rejected: {}", address, reason);
                Err(FaucetError::SubmissionRejected(reason))
            }
            Err(SubmissionError::Unreachable { reason, journaled }) => {
                if journaled.is_some() {
                    if let Err(e) = self.ledger.park(&token) {
                        error!("Reservation {} could not be parked: {}", token.id, e);
                        return Err(e);
                    }
                    self.metrics.unresolved_reservations.inc();
                } else {
                    self.ledger.release(&token)?;
                }
                error!("Chain unavailable for {}: {}", address, reason);
                Err(FaucetError::ChainUnavailable(reason))
            }
            Err(SubmissionError::Aborted(err)) => {
                if let Err(release_err) = self.ledger.release(&token) {
                    error!(
                        "Reservation {} left held after local failure: {}",
                        token.id, release_err
                    );
                }
                Err(err)
            }
        }
    }
}
