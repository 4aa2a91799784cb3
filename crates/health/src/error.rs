use spigot_common::RpcError;
use thiserror::Error;

/// Health service errors
#[derive(Error, Debug)]
pub enum HealthError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Node query failed: {0}")]
    Rpc(#[from] RpcError),
}
