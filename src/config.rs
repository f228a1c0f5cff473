use std::str::FromStr;
use std::time::Duration;

use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use serde::Deserialize;

use crate::error::{RelayerError, Result};
use crate::types::RelayerConfig;

/// Environment variable that overrides `private_key` from the file
pub const PRIVATE_KEY_ENV: &str = "RELAYER_PRIVATE_KEY";

/// On-disk relayer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RelayerSettings {
    pub rpc_url: String,
    pub database_url: String,
    pub relayer_address: String,
    pub v1_token: String,
    pub v2_token: String,
    pub migration_contract: String,
    /// Hex signing key. Prefer the environment variable.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub disbursement: DisbursementSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingSettings {
    pub interval_ms: u64,
    pub confirmations: u64,
    pub lookback_blocks: u64,
    pub max_blocks_per_poll: u64,
    pub start_block: Option<u64>,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            confirmations: 12,
            lookback_blocks: 5_000,
            max_blocks_per_poll: 2_000,
            start_block: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DisbursementSettings {
    pub confirmations: usize,
    pub rpc_timeout_secs: u64,
    pub confirmation_timeout_secs: u64,
}

impl Default for DisbursementSettings {
    fn default() -> Self {
        Self {
            confirmations: 2,
            rpc_timeout_secs: 30,
            confirmation_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn parse_address(field: &str, raw: &str) -> Result<Address> {
    if raw.trim().is_empty() {
        return Err(RelayerError::Configuration(format!("{field} is required")));
    }
    Address::from_str(raw.trim())
        .map_err(|e| RelayerError::Configuration(format!("{field} is not an address: {e}")))
}

impl RelayerSettings {
    /// Load configuration from YAML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayerError::Configuration(format!("cannot read {path}: {e}")))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| RelayerError::Configuration(e.to_string()))
    }

    /// Validate against the key in [`PRIVATE_KEY_ENV`], falling back to the file.
    pub fn validate(&self) -> Result<(RelayerConfig, LocalWallet)> {
        let env_key = std::env::var(PRIVATE_KEY_ENV).ok();
        self.validate_with_key(env_key.as_deref())
    }

    /// Parse addresses and the signing key into a runtime config. The key's
    /// derived address must equal `relayer_address`.
    pub fn validate_with_key(&self, key_override: Option<&str>) -> Result<(RelayerConfig, LocalWallet)> {
        if self.rpc_url.trim().is_empty() {
            return Err(RelayerError::Configuration("rpc_url is required".into()));
        }

        let relayer_address = parse_address("relayer_address", &self.relayer_address)?;
        let v1_token = parse_address("v1_token", &self.v1_token)?;
        let v2_token = parse_address("v2_token", &self.v2_token)?;
        let migration_contract = parse_address("migration_contract", &self.migration_contract)?;

        if v1_token == v2_token {
            return Err(RelayerError::Configuration(
                "v1_token and v2_token must differ".into(),
            ));
        }
        if self.polling.max_blocks_per_poll == 0 {
            return Err(RelayerError::Configuration(
                "polling.max_blocks_per_poll must be positive".into(),
            ));
        }

        let key = key_override
            .or(self.private_key.as_deref())
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                RelayerError::Configuration(format!(
                    "signing key missing: set {PRIVATE_KEY_ENV} or private_key"
                ))
            })?;
        // The parse error is not echoed; it can contain key material.
        let wallet = LocalWallet::from_str(key.trim())
            .map_err(|_| RelayerError::Configuration("signing key is not a valid secp256k1 key".into()))?;

        if wallet.address() != relayer_address {
            return Err(RelayerError::Configuration(format!(
                "signing key address {:?} does not match relayer_address {:?}",
                wallet.address(),
                relayer_address
            )));
        }

        let config = RelayerConfig {
            relayer_address,
            v1_token,
            v2_token,
            migration_contract,
            poll_interval: Duration::from_millis(self.polling.interval_ms),
            confirmations: self.polling.confirmations,
            lookback_blocks: self.polling.lookback_blocks,
            max_blocks_per_poll: self.polling.max_blocks_per_poll,
            start_block: self.polling.start_block,
            disbursement_confirmations: self.disbursement.confirmations,
            rpc_timeout: Duration::from_secs(self.disbursement.rpc_timeout_secs),
            confirmation_timeout: Duration::from_secs(self.disbursement.confirmation_timeout_secs),
        };

        Ok((config, wallet))
    }
}
