//! Faucet configuration

use serde::{Deserialize, Serialize};
use spigot_common::utils::logging::LoggingConfig;
use spigot_storage::StoreConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryConfig;

/// Configuration problems detected at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no private key: set private_key or private_key_file")]
    MissingKey,

    #[error("failed to read private key file {path:?}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("invalid limits: {0}")]
    InvalidLimits(String),

    #[error("{0} overflows the 128-bit amount range")]
    Overflow(&'static str),
}

/// Faucet service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaucetConfig {
    /// Server address
    pub server_addr: String,

    /// CORS origins; `*` allows any
    pub allowed_origins: Vec<String>,

    /// RPC endpoint for blockchain
    pub rpc_url: String,

    /// Per-call RPC timeout in seconds
    pub rpc_timeout_secs: u64,

    /// Faucet account private key (hex)
    pub private_key: Option<String>,

    /// File holding the private key, read when `private_key` is unset
    pub private_key_file: Option<PathBuf>,

    /// Cap on everything ever disbursed, in whole currency units
    pub total_transfer_limit: u64,

    /// Cap per recipient address, in whole currency units
    pub address_transfer_limit: u64,

    /// Amount sent per request, in whole currency units
    pub transfer_amount: u64,

    /// Decimal places of the native currency
    pub decimals: u32,

    /// Gas price to use (in wei)
    pub gas_price: u64,

    /// Gas limit for transactions
    pub gas_limit: u64,

    /// How long a submission waits for its receipt
    pub confirmation_timeout_secs: u64,

    /// Receipt polling interval while waiting
    pub confirmation_poll_ms: u64,

    /// Interval between background reconciliation passes
    pub reconcile_interval_secs: u64,

    /// Backoff for submissions that could not reach the node
    pub submit_retry: RetryConfig,

    /// Durable store
    pub db: StoreConfig,

    /// Enable metrics
    pub metrics_enabled: bool,

    /// Logging
    pub logging: LoggingConfig,
}

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:8000".to_string(),
            allowed_origins: vec!["*".to_string()],
            rpc_url: "http://localhost:8545".to_string(),
            rpc_timeout_secs: 10,
            private_key: None,
            private_key_file: None,
            total_transfer_limit: 9000,
            address_transfer_limit: 90,
            transfer_amount: 30,
            decimals: 18,
            gas_price: 1_000_000_000, // 1 Gwei
            gas_limit: 21000,
            confirmation_timeout_secs: 60,
            confirmation_poll_ms: 1000,
            reconcile_interval_secs: 120,
            submit_retry: RetryConfig::default(),
            db: StoreConfig::default(),
            metrics_enabled: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl FaucetConfig {
    /// Startup checks that do not need key material
    pub fn validate(&self) -> Result<(), ConfigError> {
        QuotaSettings::from_config(self)?;
        if self.gas_limit == 0 {
            return Err(ConfigError::InvalidLimits("gas_limit must be positive".into()));
        }
        Ok(())
    }

    /// Hex private key, inline or read from `private_key_file`
    pub fn private_key_material(&self) -> Result<String, ConfigError> {
        if let Some(key) = self.private_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Ok(key.trim().to_string());
        }
        match &self.private_key_file {
            Some(path) => read_key_file(path),
            None => Err(ConfigError::MissingKey),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn confirmation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_ms.max(1))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    /// Age at which a submitted reservation is presumed abandoned by its
    /// handler: twice the longest send, confirmation wait and retry backoff.
    pub fn stalled_submission_after(&self) -> Duration {
        let cycle = self.rpc_timeout()
            + self.confirmation_timeout()
            + Duration::from_millis(self.submit_retry.max_delay_ms);
        (cycle * 2).max(Duration::from_secs(60))
    }
}

fn read_key_file(path: &Path) -> Result<String, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::KeyFile {
        path: path.to_path_buf(),
        source,
    })?;
    let key = raw.trim();
    if key.is_empty() {
        return Err(ConfigError::InvalidKey(format!("{:?} is empty", path)));
    }
    Ok(key.to_string())
}

/// Quota parameters in the currency's smallest unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSettings {
    pub total_limit: u128,
    pub address_limit: u128,
    pub transfer_amount: u128,
}

impl QuotaSettings {
    /// Scale whole-unit limits by `10^decimals`, rejecting overflow and
    /// combinations under which no request could ever succeed.
    pub fn from_config(config: &FaucetConfig) -> Result<Self, ConfigError> {
        let unit = 10u128
            .checked_pow(config.decimals)
            .ok_or(ConfigError::Overflow("decimals"))?;
        let scale = |whole: u64, name: &'static str| {
            (whole as u128).checked_mul(unit).ok_or(ConfigError::Overflow(name))
        };

        let settings = Self {
            total_limit: scale(config.total_transfer_limit, "total_transfer_limit")?,
            address_limit: scale(config.address_transfer_limit, "address_transfer_limit")?,
            transfer_amount: scale(config.transfer_amount, "transfer_amount")?,
        };

        if settings.transfer_amount == 0 {
            return Err(ConfigError::InvalidLimits("transfer_amount must be positive".into()));
        }
        if settings.transfer_amount > settings.address_limit {
            return Err(ConfigError::InvalidLimits(
                "transfer_amount exceeds address_transfer_limit".into(),
            ));
        }
        if settings.address_limit > settings.total_limit {
            return Err(ConfigError::InvalidLimits(
                "address_transfer_limit exceeds total_transfer_limit".into(),
            ));
        }
        // the global counter may hold total_limit plus one in-flight check
        settings
            .total_limit
            .checked_add(settings.transfer_amount)
            .ok_or(ConfigError::Overflow("total_transfer_limit"))?;

        Ok(settings)
    }
}
