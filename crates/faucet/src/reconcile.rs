//! Reconciliation of reservations whose outcome is unknown
//!
//! Runs once at startup over every unsettled journal entry, then
//! periodically over parked ones and over submitted ones no handler has
//! touched for `stalled_after`. A parked entry is decided against chain
//! state only: a receipt settles it either way, and a nonce the chain has
//! moved past (or never reached) without our transaction releases it.

use chrono::Utc;
use serde::Serialize;
use spigot_common::RpcError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain::TxStatus;
use crate::error::FaucetResult;
use crate::ledger::{QuotaLedger, ReservationRecord, ReservationStatus, SubmissionRef};
use crate::metrics::FaucetMetrics;
use crate::submitter::ChainSubmitter;

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub committed: usize,
    pub released: usize,
    pub still_pending: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.committed + self.released + self.still_pending == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Commit,
    /// Drop the claim; `invalidate` when the faucet's cached nonce may be wrong
    Release { invalidate: bool },
    Hold,
}

/// Default age after which a submitted entry is taken from its handler
pub const DEFAULT_STALLED_AFTER: Duration = Duration::from_secs(600);

pub struct Reconciler {
    ledger: Arc<QuotaLedger>,
    submitter: Arc<ChainSubmitter>,
    metrics: Arc<FaucetMetrics>,
    stalled_after: Duration,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        submitter: Arc<ChainSubmitter>,
        metrics: Arc<FaucetMetrics>,
    ) -> Self {
        Self {
            ledger,
            submitter,
            metrics,
            stalled_after: DEFAULT_STALLED_AFTER,
        }
    }

    /// Must outlast any live handler's send, confirmation wait and backoff,
    /// or a pass can settle an entry its handler is still working on.
    pub fn with_stalled_after(mut self, stalled_after: Duration) -> Self {
        self.stalled_after = stalled_after;
        self
    }

    /// Settle everything a previous process left behind. Call before serving.
    pub async fn recover(&self) -> FaucetResult<ReconcileReport> {
        let unsettled = self.ledger.unsettled()?;
        if unsettled.is_empty() {
            debug!("No unsettled reservations");
            return Ok(ReconcileReport::default());
        }
        info!("Recovering {} unsettled reservations", unsettled.len());

        let report = self.settle(unsettled).await?;
        info!(
            "Recovery finished: {} committed, {} released, {} still pending",
            report.committed, report.released, report.still_pending
        );
        Ok(report)
    }

    /// One periodic pass over parked and stalled reservations
    pub async fn run_pass(&self) -> FaucetResult<ReconcileReport> {
        let now = Utc::now().timestamp();
        let mut due = Vec::new();
        for record in self.ledger.unsettled()? {
            match record.status {
                ReservationStatus::Unresolved(_) => due.push(record),
                ReservationStatus::Submitted(s) if self.is_stalled(&record, now) => {
                    // its handler never settled it, e.g. a failed commit or park
                    warn!(
                        "Reservation {} stuck as submitted ({}) for {}s, reconciling",
                        record.id,
                        s.tx_hash,
                        now - record.updated_at
                    );
                    due.push(record);
                }
                _ => {}
            }
        }

        let report = self.settle(due).await?;
        if !report.is_empty() {
            info!(
                "Reconciliation pass: {} committed, {} released, {} still pending",
                report.committed, report.released, report.still_pending
            );
        }
        Ok(report)
    }

    /// Run `run_pass` every `interval` until the handle is aborted
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick fires immediately and recovery has just run
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_pass().await {
                    error!("Reconciliation pass failed: {}", e);
                }
            }
        })
    }

    fn is_stalled(&self, record: &ReservationRecord, now: i64) -> bool {
        let age = now.saturating_sub(record.updated_at).max(0) as u64;
        Duration::from_secs(age) >= self.stalled_after
    }

    async fn settle(&self, records: Vec<ReservationRecord>) -> FaucetResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for record in records {
            let token = record.token();
            let submission = match record.status {
                // nothing was signed, so nothing can be on chain
                ReservationStatus::Reserved => {
                    self.ledger.release(&token)?;
                    report.released += 1;
                    continue;
                }
                ReservationStatus::Submitted(s) | ReservationStatus::Unresolved(s) => s,
                ReservationStatus::Committed(_) | ReservationStatus::Released => continue,
            };

            let resolution = match self.resolve(submission).await {
                Ok(resolution) => resolution,
                Err(e) => {
                    warn!("Could not resolve reservation {}: {}", record.id, e);
                    Resolution::Hold
                }
            };

            match resolution {
                Resolution::Commit => {
                    self.ledger.commit(&token)?;
                    report.committed += 1;
                    info!("Reservation {} committed via {}", record.id, submission.tx_hash);
                }
                Resolution::Release { invalidate } => {
                    self.ledger.release(&token)?;
                    report.released += 1;
                    info!(
                        "Reservation {} released, {} never landed",
                        record.id, submission.tx_hash
                    );
                    if invalidate {
                        self.submitter.invalidate_sequence().await;
                    }
                }
                Resolution::Hold => {
                    if matches!(record.status, ReservationStatus::Submitted(_)) {
                        self.ledger.park(&token)?;
                    }
                    report.still_pending += 1;
                }
            }
        }

        self.metrics
            .record_reconciled(report.committed, report.released);
        self.refresh_gauges()?;
        Ok(report)
    }

    async fn resolve(&self, submission: SubmissionRef) -> Result<Resolution, RpcError> {
        let client = self.submitter.client();
        let account = self.submitter.address();

        // read the confirmed nonce before the receipt: a transaction mined
        // between the two reads then shows up as a receipt, not as a gap
        let confirmed = client.confirmed_sequence_number(&account).await?;
        match client.transaction_status(&submission.tx_hash).await? {
            TxStatus::Confirmed { .. } => return Ok(Resolution::Commit),
            TxStatus::Reverted { block_number } => {
                debug!("{} reverted in block {}", submission.tx_hash, block_number);
                return Ok(Resolution::Release { invalidate: false });
            }
            TxStatus::Unknown => {}
        }

        if confirmed > submission.nonce {
            debug!(
                "Nonce {} was used by another transaction (confirmed nonce {})",
                submission.nonce, confirmed
            );
            return Ok(Resolution::Release { invalidate: true });
        }

        let pending = client.next_sequence_number(&account).await?;
        if pending <= submission.nonce {
            debug!(
                "Node has no transaction at nonce {} (pending nonce {})",
                submission.nonce, pending
            );
            return Ok(Resolution::Release { invalidate: true });
        }

        Ok(Resolution::Hold)
    }

    fn refresh_gauges(&self) -> FaucetResult<()> {
        let parked = self
            .ledger
            .unsettled()?
            .iter()
            .filter(|r| matches!(r.status, ReservationStatus::Unresolved(_)))
            .count();
        self.metrics.unresolved_reservations.set(parked as i64);
        Ok(())
    }
}
