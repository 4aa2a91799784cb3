//! Node liveness service
//!
//! Polls an Ethereum-compatible node on a timer and serves the latest
//! assessment at `GET /health`. Shares nothing with the faucet process.

pub mod api;
pub mod config;
pub mod detector;
pub mod error;
pub mod probe;

pub use config::HealthConfig;
pub use detector::{Assessment, Detector, DetectorSettings, HealthStatus};
pub use error::HealthError;
pub use probe::{JsonRpcProbe, NodeProbe, NodeSample};
