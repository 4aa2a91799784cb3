//! Health service configuration

use serde::{Deserialize, Serialize};
use spigot_common::utils::logging::LoggingConfig;
use std::time::Duration;

use crate::error::HealthError;

/// Health service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Server address
    pub server_addr: String,

    /// RPC endpoint of the node being watched
    pub rpc_url: String,

    /// Per-call RPC timeout in seconds
    pub rpc_timeout_secs: u64,

    /// Seconds between polls
    pub poll_interval_secs: u64,

    /// Age after which a head block or a successful poll counts as stale
    pub staleness_secs: u64,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:9000".to_string(),
            rpc_url: "http://127.0.0.1:8545".to_string(),
            rpc_timeout_secs: 10,
            poll_interval_secs: 60,
            staleness_secs: 180,
            logging: LoggingConfig {
                log_file: "health.log".to_string(),
                ..LoggingConfig::default()
            },
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), HealthError> {
        if self.rpc_url.trim().is_empty() {
            return Err(HealthError::Config("rpc_url is empty".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(HealthError::Config(
                "poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.staleness_secs < self.poll_interval_secs {
            return Err(HealthError::Config(format!(
                "staleness_secs ({}) is shorter than poll_interval_secs ({})",
                self.staleness_secs, self.poll_interval_secs
            )));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HealthConfig::default();
        config.validate().unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.staleness(), Duration::from_secs(180));
    }

    #[test]
    fn test_rejects_bad_intervals() {
        let config = HealthConfig {
            poll_interval_secs: 0,
            ..HealthConfig::default()
        };
        assert!(config.validate().is_err());

        let config = HealthConfig {
            staleness_secs: 30,
            ..HealthConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
