//! Gas price recommendation from an external price station

use super::state::TxState;
use crate::config::GasOracleConfig;
use crate::error::{TransactorError, TransactorResult};
use crate::ledger::LedgerClient;

use async_trait::async_trait;
use ethers::types::U256;
#[cfg(test)]
use mockall::automock;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Speed tier a transaction is priced for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedTier {
    SafeLow,
    Average,
    #[default]
    Fast,
    Fastest,
}

impl fmt::Display for SpeedTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpeedTier::SafeLow => "safelow",
            SpeedTier::Average => "average",
            SpeedTier::Fast => "fast",
            SpeedTier::Fastest => "fastest",
        };
        f.write_str(name)
    }
}

impl FromStr for SpeedTier {
    type Err = TransactorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "safelow" | "safe-low" => Ok(SpeedTier::SafeLow),
            "average" => Ok(SpeedTier::Average),
            "fast" => Ok(SpeedTier::Fast),
            "fastest" => Ok(SpeedTier::Fastest),
            other => Err(TransactorError::Config(format!("invalid speed tier: {}", other))),
        }
    }
}

/// Source of recommended gas prices
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GasOracle: Send + Sync {
    /// Recommended price in wei for `tier`. Errors mean "no recommendation".
    async fn price(&self, tier: SpeedTier) -> TransactorResult<U256>;
}

/// ethgasstation-style oracle: a JSON document with one figure per tier
pub struct GasStationOracle {
    client: reqwest::Client,
    url: String,
    scale_exponent: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GasStationResponse {
    safe_low: f64,
    average: f64,
    fast: f64,
    fastest: f64,
}

impl GasStationOracle {
    pub fn new(config: &GasOracleConfig) -> TransactorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| TransactorError::GasOracle(format!("cannot build http client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            scale_exponent: config.scale_exponent,
        })
    }
}

#[async_trait]
impl GasOracle for GasStationOracle {
    async fn price(&self, tier: SpeedTier) -> TransactorResult<U256> {
        let response = self
            .client
            .get(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| TransactorError::GasOracle(format!("cannot connect to gas station: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransactorError::GasOracle(format!(
                "unexpected status code {} from gas station",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TransactorError::GasOracle(format!("cannot read gas station body: {}", e)))?;

        let price = parse_tier_price(&body, tier, self.scale_exponent)?;
        debug!("Gas station recommends {} wei for tier {}", price, tier);
        Ok(price)
    }
}

/// Extract the figure for `tier` and scale it to wei
pub(crate) fn parse_tier_price(body: &str, tier: SpeedTier, scale_exponent: u32) -> TransactorResult<U256> {
    let data: GasStationResponse = serde_json::from_str(body)
        .map_err(|e| TransactorError::GasOracle(format!("cannot decode gas station body: {}", e)))?;

    let figure = match tier {
        SpeedTier::SafeLow => data.safe_low,
        SpeedTier::Average => data.average,
        SpeedTier::Fast => data.fast,
        SpeedTier::Fastest => data.fastest,
    };

    let scaled = figure * 10f64.powi(scale_exponent as i32);
    if !scaled.is_finite() || scaled < 1.0 || scaled > u128::MAX as f64 {
        return Err(TransactorError::GasOracle(format!(
            "unusable {} price {} from gas station",
            tier, figure
        )));
    }

    Ok(U256::from(scaled as u128))
}

/// Uses the node's own gas price suggestion for every tier
pub struct NodeGasOracle {
    client: Arc<dyn LedgerClient>,
}

impl NodeGasOracle {
    pub fn new(client: Arc<dyn LedgerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GasOracle for NodeGasOracle {
    async fn price(&self, _tier: SpeedTier) -> TransactorResult<U256> {
        Ok(self.client.gas_price().await?)
    }
}

/// Refreshes the cached gas price from an oracle, best-effort
#[derive(Clone)]
pub struct GasPricer {
    oracle: Arc<dyn GasOracle>,
    tier: SpeedTier,
}

impl GasPricer {
    pub fn new(oracle: Arc<dyn GasOracle>, tier: SpeedTier) -> Self {
        Self { oracle, tier }
    }

    /// Ask the oracle directly
    pub async fn recommend(&self) -> TransactorResult<U256> {
        self.oracle.price(self.tier).await
    }

    /// Replace the cached price on success. Failures are logged and leave the
    /// previous price in place.
    pub async fn refresh(&self, state: &mut TxState) -> bool {
        match self.oracle.price(self.tier).await {
            Ok(price) if state.set_gas_price(price) => true,
            Ok(_) => {
                warn!("Gas oracle returned a zero price, keeping {}", state.gas_price());
                false
            }
            Err(e) => {
                warn!("cannot update gas price = {}", e);
                false
            }
        }
    }
}
