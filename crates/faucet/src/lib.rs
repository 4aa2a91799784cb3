//! Testnet faucet
//!
//! Disburses a fixed amount of native currency from one funding account to
//! any address that asks, under a global cap and a per-address cap:
//! - Quota ledger with a durable reservation journal
//! - Serialized nonce management for the funding account
//! - Reconciliation of submissions whose outcome was unknown
//! - Prometheus metrics and a JSON HTTP API

pub mod api;
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod reconcile;
pub mod retry;
pub mod submitter;
pub mod transaction;

pub use chain::{ChainClient, Confirmation, JsonRpcChainClient, TxStatus};
pub use config::{ConfigError, FaucetConfig, QuotaSettings};
pub use engine::{Disbursement, DisbursementEngine};
pub use error::{FaucetError, FaucetResult, QuotaLimit};
pub use ledger::{
    LedgerStatistics, QuotaLedger, ReservationRecord, ReservationStatus, ReservationToken,
    SubmissionRef,
};
pub use metrics::FaucetMetrics;
pub use reconcile::{ReconcileReport, Reconciler, DEFAULT_STALLED_AFTER};
pub use retry::RetryConfig;
pub use submitter::{
    ChainSubmitter, PendingTransfer, Receipt, SubmissionError, SubmissionJournal, SubmitOutcome,
    SubmitterSettings,
};
pub use transaction::{FundingAccount, SignedTransfer, TransferTx};
