//! Configuration management for the transactor
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::retry::BackoffPolicy;
use crate::tx::SpeedTier;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub ledger: LedgerConfig,
    pub gas_oracle: GasOracleConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub rpc_urls: Vec<String>,
    pub chain_id: Option<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasOracleConfig {
    pub url: String,
    #[serde(default)]
    pub tier: SpeedTier,
    /// Oracle figures are multiplied by 10^scale_exponent to obtain wei
    #[serde(default = "default_scale_exponent")]
    pub scale_exponent: u32,
    #[serde(default = "default_oracle_timeout_ms")]
    pub timeout_ms: u64,
}

/// Tuning of the submission engine
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Bound on waiting for a single broadcast to be included
    pub inclusion_timeout_secs: u64,
    /// Nonce-fault retries allowed per submission
    pub nonce_retry_budget: u32,
    /// Pause before re-reading the pending nonce after an unclassified nonce fault
    pub nonce_retry_delay_ms: u64,
    pub confirmation_poll_ms: u64,
    /// Bound on the ledger reads performed while constructing an account
    pub init_timeout_secs: u64,
    pub backoff: BackoffPolicy,
}

impl EngineConfig {
    pub fn inclusion_timeout(&self) -> Duration {
        Duration::from_secs(self.inclusion_timeout_secs)
    }

    pub fn nonce_retry_delay(&self) -> Duration {
        Duration::from_millis(self.nonce_retry_delay_ms)
    }

    pub fn confirmation_poll(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inclusion_timeout_secs: 300,
            nonce_retry_budget: 60,
            nonce_retry_delay_ms: 1_000,
            confirmation_poll_ms: 500,
            init_timeout_secs: 60,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_scale_exponent() -> u32 {
    8
}

fn default_oracle_timeout_ms() -> u64 {
    10_000
}

impl Settings {
    /// Load settings from `TRANSACTOR_CONFIG` or `config/default.toml`
    pub fn load() -> Result<Self> {
        let config_path = env::var("TRANSACTOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.ledger.rpc_urls.is_empty() {
            anyhow::bail!("At least one ledger RPC URL must be configured");
        }
        if self.gas_oracle.url.is_empty() {
            tracing::warn!("Gas oracle URL is empty - node gas price will be used");
        }

        let backoff = &self.engine.backoff;
        if backoff.initial_ms == 0 || backoff.multiplier < 1.0 || backoff.max_ms < backoff.initial_ms {
            anyhow::bail!("Invalid backoff policy: {:?}", backoff);
        }
        if self.engine.inclusion_timeout_secs == 0 {
            anyhow::bail!("Inclusion timeout must be positive");
        }
        if self.engine.confirmation_poll_ms == 0 {
            anyhow::bail!("Confirmation poll interval must be positive");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}
