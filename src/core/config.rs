//! Protocol configuration and parameters.
//!
//! Thresholds are written as decimal strings (`"1.1"`, `"0.000000001"`) in
//! JSON config files and held as [`FixedPoint`] in memory. Parameters come
//! from, in increasing priority:
//! - Compiled defaults
//! - A JSON file ([`ProtocolParams::load`])
//! - `STABILIO_*` environment variables ([`ProtocolParams::from_env`])

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use rust_decimal::Decimal;

use crate::error::{Error, Result};
use crate::utils::constants::*;
use crate::utils::math::FixedPoint;
use crate::utils::validation::validate_ratio_param;

// ═══════════════════════════════════════════════════════════════════════════════
// DECIMAL SERDE
// ═══════════════════════════════════════════════════════════════════════════════

/// Serialize a [`FixedPoint`] as a human-readable decimal string
pub(crate) mod fixed_as_decimal {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(value: &FixedPoint, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let decimal = value.to_decimal().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&decimal.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<FixedPoint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let decimal = Decimal::from_str(&s).map_err(serde::de::Error::custom)?;
        FixedPoint::from_decimal(decimal).map_err(serde::de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROTOCOL PARAMETERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Protocol parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolParams {
    /// Protocol version
    pub version: String,

    /// Minimum collateralization ratio (MCR)
    /// Below this, positions can be liquidated
    #[serde(with = "fixed_as_decimal")]
    pub min_collateral_ratio: FixedPoint,

    /// Critical collateralization ratio (CCR)
    /// When system TCR falls below this, recovery mode applies
    #[serde(with = "fixed_as_decimal")]
    pub critical_collateral_ratio: FixedPoint,

    /// Minimum non-zero debt per position (zero disables the floor)
    #[serde(with = "fixed_as_decimal")]
    pub min_debt: FixedPoint,

    /// Compounded deposits below this are zeroed on withdrawal
    #[serde(with = "fixed_as_decimal")]
    pub deposit_dust: FixedPoint,

    /// Upper bound on positions processed by one batch liquidation
    pub max_batch_size: usize,

    /// Number of events kept in bounded histories
    pub max_events: usize,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            min_collateral_ratio: FixedPoint::from_percentage(MIN_COLLATERAL_RATIO_PCT),
            critical_collateral_ratio: FixedPoint::from_percentage(CRITICAL_COLLATERAL_RATIO_PCT),
            min_debt: FixedPoint::ZERO,
            deposit_dust: FixedPoint::from_raw(DEPOSIT_DUST_RAW),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

impl ProtocolParams {
    /// Override MCR
    pub fn with_mcr(mut self, mcr: FixedPoint) -> Self {
        self.min_collateral_ratio = mcr;
        self
    }

    /// Override CCR
    pub fn with_ccr(mut self, ccr: FixedPoint) -> Self {
        self.critical_collateral_ratio = ccr;
        self
    }

    /// Override the minimum debt floor
    pub fn with_min_debt(mut self, min_debt: FixedPoint) -> Self {
        self.min_debt = min_debt;
        self
    }

    /// Override the batch size cap
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Validate parameters are consistent
    pub fn validate(&self) -> Result<()> {
        validate_ratio_param(self.min_collateral_ratio, "min_collateral_ratio")?;
        validate_ratio_param(self.critical_collateral_ratio, "critical_collateral_ratio")?;

        if self.critical_collateral_ratio <= self.min_collateral_ratio {
            return Err(Error::InvalidParameter {
                name: "critical_collateral_ratio".into(),
                reason: format!(
                    "CCR {} must exceed MCR {}",
                    self.critical_collateral_ratio, self.min_collateral_ratio
                ),
            });
        }

        if self.deposit_dust >= FixedPoint::ONE {
            return Err(Error::InvalidParameter {
                name: "deposit_dust".into(),
                reason: "dust threshold must be below one unit".into(),
            });
        }

        if self.max_batch_size == 0 {
            return Err(Error::InvalidParameter {
                name: "max_batch_size".into(),
                reason: "must be greater than 0".into(),
            });
        }

        Ok(())
    }

    /// Load from a JSON file and validate
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        let params: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        params.validate()?;
        Ok(params)
    }

    /// Save to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Config(e.to_string()))?;
        }

        std::fs::write(path, content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Overlay `STABILIO_*` environment variables on top of `self`
    pub fn from_env(mut self) -> Result<Self> {
        if let Some(mcr) = env_fixed("STABILIO_MCR")? {
            self.min_collateral_ratio = mcr;
        }

        if let Some(ccr) = env_fixed("STABILIO_CCR")? {
            self.critical_collateral_ratio = ccr;
        }

        if let Some(min_debt) = env_fixed("STABILIO_MIN_DEBT")? {
            self.min_debt = min_debt;
        }

        if let Ok(size) = std::env::var("STABILIO_MAX_BATCH") {
            self.max_batch_size = size
                .parse()
                .map_err(|e| Error::Config(format!("STABILIO_MAX_BATCH: {}", e)))?;
        }

        self.validate()?;
        Ok(self)
    }
}

fn env_fixed(key: &str) -> Result<Option<FixedPoint>> {
    match std::env::var(key) {
        Ok(raw) => {
            let decimal =
                Decimal::from_str(&raw).map_err(|e| Error::Config(format!("{}: {}", key, e)))?;
            FixedPoint::from_decimal(decimal).map(Some)
        }
        Err(_) => Ok(None),
    }
}
