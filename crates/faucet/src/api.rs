//! HTTP API for the faucet

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use spigot_common::Address;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::engine::{Disbursement, DisbursementEngine};
use crate::error::{FaucetError, FaucetResult};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DisbursementEngine>,
    pub metrics_enabled: bool,
}

/// Funding request body
#[derive(Debug, Deserialize)]
pub struct FundRequest {
    pub address: String,
}

/// Body of a 201 or 202 funding response
#[derive(Debug, Serialize)]
pub struct FundResponse {
    pub status: &'static str,
    pub tx_hash: String,
    pub nonce: u64,
    pub amount: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

impl From<Disbursement> for FundResponse {
    fn from(disbursement: Disbursement) -> Self {
        match disbursement {
            Disbursement::Committed(receipt) => Self {
                status: "success",
                tx_hash: receipt.tx_hash.to_string(),
                nonce: receipt.nonce,
                amount: receipt.amount.to_string(),
                address: receipt.destination.to_string(),
                block_number: Some(receipt.block_number),
            },
            Disbursement::Pending(pending) => Self {
                status: "pending",
                tx_hash: pending.tx_hash.to_string(),
                nonce: pending.nonce,
                amount: pending.amount.to_string(),
                address: pending.destination.to_string(),
                block_number: None,
            },
        }
    }
}

/// Faucet status
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub address: String,
    pub chain_id: u64,
    pub decimals: u32,
    pub transfer_amount: String,
    pub total_transfer_limit: String,
    pub address_transfer_limit: String,
    pub global_total: String,
    pub remaining_total: String,
    pub unique_addresses: usize,
    pub committed: usize,
    pub released: usize,
    pub unsettled: usize,
}

/// Quota usage of one address
#[derive(Debug, Serialize)]
pub struct AddressResponse {
    pub address: String,
    pub total: String,
    pub remaining: String,
    pub limit: String,
}

/// Build the router with CORS and request tracing
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/address/:address", get(address_handler))
        .route("/api/fund", post(fund_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

/// Request funds for an address
pub async fn fund_handler(
    State(state): State<AppState>,
    body: Result<Json<FundRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!("Malformed fund request: {}", rejection);
            return FaucetError::InvalidRequest(rejection.body_text()).into_response();
        }
    };
    info!("Fund request for {}", request.address);

    match state.engine.request_funds(&request.address).await {
        Ok(disbursement) => {
            let status = if disbursement.is_pending() {
                StatusCode::ACCEPTED
            } else {
                StatusCode::CREATED
            };
            (status, Json(FundResponse::from(disbursement))).into_response()
        }
        Err(e) => {
            match &e {
                FaucetError::QuotaDenied(_)
                | FaucetError::InvalidAddress(_)
                | FaucetError::SubmissionRejected(_) => debug!("Fund request refused: {}", e),
                _ => error!("Fund request failed: {}", e),
            }
            e.into_response()
        }
    }
}

/// Faucet address, limits and totals
pub async fn status_handler(State(state): State<AppState>) -> FaucetResult<Json<StatusResponse>> {
    let engine = &state.engine;
    let limits = engine.ledger().limits();
    let stats = engine.ledger().statistics()?;

    Ok(Json(StatusResponse {
        address: engine.submitter().address().to_string(),
        chain_id: engine.submitter().chain_id(),
        decimals: engine.decimals(),
        transfer_amount: limits.transfer_amount.to_string(),
        total_transfer_limit: limits.total_limit.to_string(),
        address_transfer_limit: limits.address_limit.to_string(),
        global_total: stats.global_total.to_string(),
        remaining_total: limits.total_limit.saturating_sub(stats.global_total).to_string(),
        unique_addresses: stats.unique_addresses,
        committed: stats.committed,
        released: stats.released,
        unsettled: stats.unsettled,
    }))
}

/// Cumulative and remaining quota for one address
pub async fn address_handler(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> FaucetResult<Json<AddressResponse>> {
    let address: Address = raw
        .parse()
        .map_err(|e| FaucetError::InvalidAddress(format!("{}", e)))?;
    let limits = state.engine.ledger().limits();
    let total = state.engine.ledger().address_total(&address)?;

    Ok(Json(AddressResponse {
        address: address.to_string(),
        total: total.to_string(),
        remaining: limits.address_limit.saturating_sub(total).to_string(),
        limit: limits.address_limit.to_string(),
    }))
}

/// Prometheus exposition
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    if !state.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.engine.metrics().gather() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Process liveness
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Service info
pub async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "Spigot Faucet",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Testnet faucet with durable per-address and global quotas",
        "endpoints": {
            "POST /api/fund": "Request funds",
            "GET /api/status": "Faucet address, limits and totals",
            "GET /api/address/{address}": "Quota usage for one address",
            "GET /health": "Health check",
            "GET /metrics": "Prometheus metrics"
        }
    }))
}
