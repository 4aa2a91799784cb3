//! Error types for the faucet service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use spigot_common::RpcError;
use spigot_storage::StorageError;
use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;

/// Which cap refused a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuotaLimit {
    /// `TotalTransferLimit` would be exceeded
    TotalLimit,
    /// `AddressTransferLimit` would be exceeded
    AddressLimit,
}

impl fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaLimit::TotalLimit => f.write_str("total-limit"),
            QuotaLimit::AddressLimit => f.write_str("address-limit"),
        }
    }
}

/// Faucet service errors
#[derive(Error, Debug)]
pub enum FaucetError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Quota exhausted: {0}")]
    QuotaDenied(QuotaLimit),

    #[error("Transaction rejected by chain: {0}")]
    SubmissionRejected(String),

    #[error("Chain unavailable: {0}")]
    ChainUnavailable(String),

    #[error("Chain client error: {0}")]
    Chain(#[from] RpcError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Reservation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: u64,
        from: &'static str,
        to: &'static str,
    },

    #[error("Unknown reservation {0}")]
    UnknownReservation(u64),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl FaucetError {
    /// Machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            FaucetError::InvalidAddress(_) => "INVALID_ADDRESS",
            FaucetError::InvalidRequest(_) => "INVALID_REQUEST",
            FaucetError::QuotaDenied(QuotaLimit::TotalLimit) => "TOTAL_LIMIT_REACHED",
            FaucetError::QuotaDenied(QuotaLimit::AddressLimit) => "ADDRESS_LIMIT_REACHED",
            FaucetError::SubmissionRejected(_) => "TRANSACTION_REJECTED",
            FaucetError::ChainUnavailable(_) | FaucetError::Chain(_) => "CHAIN_UNAVAILABLE",
            FaucetError::Storage(_) => "STORAGE_UNAVAILABLE",
            FaucetError::InvalidTransition { .. } | FaucetError::UnknownReservation(_) => {
                "LEDGER_INCONSISTENT"
            }
            FaucetError::Config(_) => "CONFIG_ERROR",
            FaucetError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Pipeline stage that failed, as reported to callers
    pub fn stage(&self) -> &'static str {
        match self {
            FaucetError::InvalidAddress(_) | FaucetError::InvalidRequest(_) => "validation",
            FaucetError::QuotaDenied(_) => "quota",
            FaucetError::SubmissionRejected(_) => "submission",
            FaucetError::ChainUnavailable(_) | FaucetError::Chain(_) => "chain",
            FaucetError::Storage(_)
            | FaucetError::InvalidTransition { .. }
            | FaucetError::UnknownReservation(_) => "storage",
            FaucetError::Config(_) | FaucetError::InternalError(_) => "internal",
        }
    }
}

impl IntoResponse for FaucetError {
    fn into_response(self) -> Response {
        let (status, outcome, reason) = match &self {
            FaucetError::InvalidAddress(msg) | FaucetError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid", msg.clone())
            }
            FaucetError::QuotaDenied(limit) => (StatusCode::FORBIDDEN, "denied", limit.to_string()),
            FaucetError::SubmissionRejected(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "rejected", msg.clone())
            }
            FaucetError::ChainUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.clone())
            }
            FaucetError::Chain(err) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", err.to_string()),
            FaucetError::Storage(err) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", err.to_string())
            }
            other => (StatusCode::INTERNAL_SERVER_ERROR, "error", other.to_string()),
        };

        let body = Json(json!({
            "status": outcome,
            "error": self.code(),
            "stage": self.stage(),
            "reason": reason,
            "timestamp": chrono::Utc::now().to_rfc3339()
        }));

        (status, body).into_response()
    }
}

pub type FaucetResult<T> = Result<T, FaucetError>;
