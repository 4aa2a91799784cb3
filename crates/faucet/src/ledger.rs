//! Quota ledger
//!
//! Durable per-address totals, the global total, and a journal of
//! reservations. A reservation bumps both counters and writes its journal
//! entry in one serializable transaction across three trees, and the write is
//! flushed before `try_reserve` returns. The counters therefore always include
//! in-flight claims: a crash leaves quota consumed, never double-spendable.
//!
//! Journal entries carry an explicit [`ReservationStatus`] so a restart can
//! find every claim whose outcome was never settled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{abort, ConflictableTransactionResult, TransactionError, TransactionResult};
use sled::{IVec, Transactional, Tree};
use spigot_common::{Address, Hash};
use spigot_storage::{decode, decode_u128, encode, DurableStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::QuotaSettings;
use crate::error::{FaucetError, FaucetResult, QuotaLimit};

const QUOTAS_TREE: &str = "quotas";
const COUNTERS_TREE: &str = "counters";
const RESERVATIONS_TREE: &str = "reservations";
const GLOBAL_TOTAL_KEY: &[u8] = b"global_total";

/// Transaction that carries a reservation on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRef {
    pub nonce: u64,
    pub tx_hash: Hash,
}

/// Lifecycle of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Quota consumed, nothing signed yet
    Reserved,
    /// Signed and journaled; a handler is submitting it
    Submitted(SubmissionRef),
    /// Outcome unknown, waiting for reconciliation
    Unresolved(SubmissionRef),
    /// The transfer landed
    Committed(SubmissionRef),
    /// The increment was reversed
    Released,
}

impl ReservationStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Submitted(_) => "submitted",
            ReservationStatus::Unresolved(_) => "unresolved",
            ReservationStatus::Committed(_) => "committed",
            ReservationStatus::Released => "released",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, ReservationStatus::Committed(_) | ReservationStatus::Released)
    }

    pub fn submission(&self) -> Option<SubmissionRef> {
        match self {
            ReservationStatus::Submitted(s)
            | ReservationStatus::Unresolved(s)
            | ReservationStatus::Committed(s) => Some(*s),
            ReservationStatus::Reserved | ReservationStatus::Released => None,
        }
    }
}

/// Handle on one held reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationToken {
    pub id: u64,
    pub address: Address,
    pub amount: u128,
}

/// Journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub id: u64,
    pub address: Address,
    pub amount: u128,
    pub status: ReservationStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ReservationRecord {
    pub fn token(&self) -> ReservationToken {
        ReservationToken {
            id: self.id,
            address: self.address,
            amount: self.amount,
        }
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.created_at, 0).unwrap_or_else(Utc::now)
    }
}

/// Ledger statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatistics {
    pub global_total: u128,
    pub unique_addresses: usize,
    pub committed: usize,
    pub released: usize,
    pub unsettled: usize,
}

/// What a transition does to a journal entry
enum Step {
    /// Already in the target state
    Keep,
    /// Rewrite the status only
    Move(ReservationStatus),
    /// Reverse the increment and mark released
    Unwind,
}

/// Quota ledger
pub struct QuotaLedger {
    store: Arc<DurableStore>,
    quotas: Tree,
    counters: Tree,
    reservations: Tree,
    limits: QuotaSettings,
}

impl QuotaLedger {
    /// Open the ledger trees in `store`
    pub fn open(store: Arc<DurableStore>, limits: QuotaSettings) -> FaucetResult<Self> {
        let quotas = store.tree(QUOTAS_TREE)?;
        let counters = store.tree(COUNTERS_TREE)?;
        let reservations = store.tree(RESERVATIONS_TREE)?;

        let ledger = Self {
            store,
            quotas,
            counters,
            reservations,
            limits,
        };

        let global = ledger.global_total()?;
        if global > limits.total_limit {
            warn!(
                "Stored global total {} is above the configured limit {}; no further disbursements",
                global, limits.total_limit
            );
        }
        info!("Quota ledger opened, global total: {}", global);

        Ok(ledger)
    }

    pub fn limits(&self) -> QuotaSettings {
        self.limits
    }

    /// Claim `amount` for `address` against both caps.
    ///
    /// On success the increment and a `Reserved` journal entry are durable.
    /// On denial nothing is written.
    pub fn try_reserve(&self, address: &Address, amount: u128) -> FaucetResult<ReservationToken> {
        self.store.ensure_writable()?;
        let limits = self.limits;
        let now = Utc::now().timestamp();

        let result: TransactionResult<ReservationToken, FaucetError> =
            (&self.quotas, &self.counters, &self.reservations).transaction(
                |(quotas, counters, reservations)| {
                    let global = read_counter(GLOBAL_TOTAL_KEY, counters.get(GLOBAL_TOTAL_KEY)?)?;
                    let current = read_counter(address.as_bytes(), quotas.get(address.as_bytes())?)?;

                    let new_global = match global.checked_add(amount) {
                        Some(v) if v <= limits.total_limit => v,
                        _ => return abort(FaucetError::QuotaDenied(QuotaLimit::TotalLimit)),
                    };
                    let new_current = match current.checked_add(amount) {
                        Some(v) if v <= limits.address_limit => v,
                        _ => return abort(FaucetError::QuotaDenied(QuotaLimit::AddressLimit)),
                    };

                    let id = reservations.generate_id()?;
                    let record = ReservationRecord {
                        id,
                        address: *address,
                        amount,
                        status: ReservationStatus::Reserved,
                        created_at: now,
                        updated_at: now,
                    };
                    let encoded = match encode(&record) {
                        Ok(bytes) => bytes,
                        Err(e) => return abort(FaucetError::from(e)),
                    };

                    counters.insert(GLOBAL_TOTAL_KEY, new_global.to_be_bytes().to_vec())?;
                    quotas.insert(address.as_bytes(), new_current.to_be_bytes().to_vec())?;
                    reservations.insert(&id.to_be_bytes()[..], encoded)?;

                    Ok(record.token())
                },
            );

        let token = settle(result)?;
        self.store.persist()?;

        debug!("Reserved {} for {} (reservation {})", amount, address, token.id);
        Ok(token)
    }

    /// Journal the transaction about to be sent for `token`
    pub fn record_submission(
        &self,
        token: &ReservationToken,
        submission: SubmissionRef,
    ) -> FaucetResult<ReservationRecord> {
        self.apply(token.id, "submitted", move |status| match status {
            ReservationStatus::Reserved | ReservationStatus::Submitted(_) => {
                Some(Step::Move(ReservationStatus::Submitted(submission)))
            }
            _ => None,
        })
    }

    /// Hand a submitted reservation over to reconciliation
    pub fn park(&self, token: &ReservationToken) -> FaucetResult<ReservationRecord> {
        self.apply(token.id, "unresolved", |status| match status {
            ReservationStatus::Submitted(s) => Some(Step::Move(ReservationStatus::Unresolved(*s))),
            ReservationStatus::Unresolved(_) => Some(Step::Keep),
            _ => None,
        })
    }

    /// Make a reservation final. Idempotent.
    pub fn commit(&self, token: &ReservationToken) -> FaucetResult<ReservationRecord> {
        self.apply(token.id, "committed", |status| match status {
            ReservationStatus::Submitted(s) | ReservationStatus::Unresolved(s) => {
                Some(Step::Move(ReservationStatus::Committed(*s)))
            }
            ReservationStatus::Committed(_) => Some(Step::Keep),
            ReservationStatus::Reserved | ReservationStatus::Released => None,
        })
    }

    /// Reverse a reservation exactly. Idempotent.
    pub fn release(&self, token: &ReservationToken) -> FaucetResult<ReservationRecord> {
        self.apply(token.id, "released", |status| match status {
            ReservationStatus::Reserved
            | ReservationStatus::Submitted(_)
            | ReservationStatus::Unresolved(_) => Some(Step::Unwind),
            ReservationStatus::Released => Some(Step::Keep),
            ReservationStatus::Committed(_) => None,
        })
    }

    fn apply<F>(&self, id: u64, target: &'static str, decide: F) -> FaucetResult<ReservationRecord>
    where
        F: Fn(&ReservationStatus) -> Option<Step>,
    {
        self.store.ensure_writable()?;
        let key = id.to_be_bytes();
        let now = Utc::now().timestamp();

        let result: TransactionResult<(ReservationRecord, bool), FaucetError> =
            (&self.quotas, &self.counters, &self.reservations).transaction(
                |(quotas, counters, reservations)| {
                    let mut record: ReservationRecord = match reservations.get(&key[..])? {
                        Some(bytes) => match decode(&bytes) {
                            Ok(record) => record,
                            Err(e) => return abort(FaucetError::from(e)),
                        },
                        None => return abort(FaucetError::UnknownReservation(id)),
                    };

                    let next = match decide(&record.status) {
                        Some(Step::Keep) => return Ok((record, false)),
                        Some(Step::Move(next)) => next,
                        Some(Step::Unwind) => {
                            let address_key = record.address.as_bytes();
                            let global =
                                read_counter(GLOBAL_TOTAL_KEY, counters.get(GLOBAL_TOTAL_KEY)?)?;
                            let current = read_counter(address_key, quotas.get(address_key)?)?;
                            let (Some(new_global), Some(new_current)) = (
                                global.checked_sub(record.amount),
                                current.checked_sub(record.amount),
                            ) else {
                                return abort(FaucetError::InternalError(format!(
                                    "releasing reservation {} would underflow the counters",
                                    id
                                )));
                            };
                            counters.insert(GLOBAL_TOTAL_KEY, new_global.to_be_bytes().to_vec())?;
                            quotas.insert(address_key, new_current.to_be_bytes().to_vec())?;
                            ReservationStatus::Released
                        }
                        None => {
                            return abort(FaucetError::InvalidTransition {
                                id,
                                from: record.status.name(),
                                to: target,
                            })
                        }
                    };

                    record.status = next;
                    record.updated_at = now;
                    let encoded = match encode(&record) {
                        Ok(bytes) => bytes,
                        Err(e) => return abort(FaucetError::from(e)),
                    };
                    reservations.insert(&key[..], encoded)?;
                    Ok((record, true))
                },
            );

        let (record, changed) = settle(result)?;
        if changed {
            self.store.persist()?;
            debug!("Reservation {} is now {}", id, record.status.name());
        }
        Ok(record)
    }

    /// Cumulative amount held or disbursed for `address`
    pub fn address_total(&self, address: &Address) -> FaucetResult<u128> {
        let value = self.quotas.get(address.as_bytes()).map_err(storage_error)?;
        Ok(decode_u128(address.as_bytes(), value.as_deref())?)
    }

    /// Amount held or disbursed across all addresses
    pub fn global_total(&self) -> FaucetResult<u128> {
        let value = self.counters.get(GLOBAL_TOTAL_KEY).map_err(storage_error)?;
        Ok(decode_u128(GLOBAL_TOTAL_KEY, value.as_deref())?)
    }

    pub fn reservation(&self, id: u64) -> FaucetResult<Option<ReservationRecord>> {
        match self.reservations.get(id.to_be_bytes()).map_err(storage_error)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every reservation not yet committed or released, oldest first
    pub fn unsettled(&self) -> FaucetResult<Vec<ReservationRecord>> {
        let mut records = Vec::new();
        for item in self.reservations.iter() {
            let (_, value) = item.map_err(storage_error)?;
            let record: ReservationRecord = decode(&value)?;
            if !record.status.is_settled() {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Most recent journal entries, newest first
    pub fn recent(&self, limit: usize) -> FaucetResult<Vec<ReservationRecord>> {
        let mut records = Vec::with_capacity(limit);
        for item in self.reservations.iter().rev().take(limit) {
            let (_, value) = item.map_err(storage_error)?;
            records.push(decode(&value)?);
        }
        Ok(records)
    }

    pub fn statistics(&self) -> FaucetResult<LedgerStatistics> {
        let mut stats = LedgerStatistics {
            global_total: self.global_total()?,
            unique_addresses: self.quotas.len(),
            ..LedgerStatistics::default()
        };

        for item in self.reservations.iter() {
            let (_, value) = item.map_err(storage_error)?;
            let record: ReservationRecord = decode(&value)?;
            match record.status {
                ReservationStatus::Committed(_) => stats.committed += 1,
                ReservationStatus::Released => stats.released += 1,
                _ => stats.unsettled += 1,
            }
        }

        Ok(stats)
    }
}

fn read_counter(key: &[u8], value: Option<IVec>) -> ConflictableTransactionResult<u128, FaucetError> {
    match decode_u128(key, value.as_deref()) {
        Ok(v) => Ok(v),
        Err(e) => abort(FaucetError::from(e)),
    }
}

fn settle<T>(result: TransactionResult<T, FaucetError>) -> FaucetResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(err)) => Err(err),
        Err(TransactionError::Storage(err)) => Err(storage_error(err)),
    }
}

fn storage_error(err: sled::Error) -> FaucetError {
    FaucetError::Storage(err.into())
}
