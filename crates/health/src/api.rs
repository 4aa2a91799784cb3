//! HTTP surface of the health service

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::detector::{Detector, HealthStatus};

/// Build identifier baked in at compile time, `dev` otherwise
pub const BUILD: &str = match option_env!("SPIGOT_BUILD") {
    Some(build) => build,
    None => "dev",
};

/// Liveness report served at `/health`
#[derive(Debug, Serialize)]
pub struct LivenessReport {
    pub node_version: String,
    pub build: String,
    /// Head block height
    pub epoch: u64,
    pub behind: u64,
    pub peer_count: u64,
    pub host: String,
    pub network_id: String,
    pub service_version: String,
    pub status: HealthStatus,
    pub last_poll: Option<DateTime<Utc>>,
    pub reasons: Vec<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub detector: Arc<Detector>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<LivenessReport>) {
    let assessment = state.detector.assess().await;

    let code = if assessment.status == HealthStatus::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let sample = assessment.sample.unwrap_or_default();
    let report = LivenessReport {
        node_version: sample.client_version,
        build: BUILD.to_string(),
        epoch: sample.head_number,
        behind: sample.behind,
        peer_count: sample.peer_count,
        host: state.detector.endpoint(),
        network_id: sample.network_id,
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        status: assessment.status,
        last_poll: assessment.last_poll,
        reasons: assessment.reasons,
    };

    (code, Json(report))
}
