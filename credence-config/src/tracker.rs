//! Balance tracker configuration.
//!
//! Controls the economics of the tracker:
//! - Default price factors applied to newly connected peers
//! - Expiration time constants of the positive and negative decay curves
//! - Persistence thresholds and the periodic flush interval

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::validation;

/// Linear cost weights for one balance polarity.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct PriceFactorsConfig {
    /// Cost per nanosecond of connected time.
    #[serde(default)]
    pub time_factor: f64,
    /// Cost per nanosecond per unit of assigned capacity.
    #[serde(default)]
    pub capacity_factor: f64,
    /// Multiplier applied to the cost of each served request.
    #[serde(default)]
    pub request_factor: f64,
}

/// Balance tracker configuration.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct TrackerConfig {
    /// Positive balance expiration time constant in seconds (0 disables decay).
    #[serde(default)]
    pub pos_expiration_secs: u64,

    /// Negative balance expiration time constant in seconds (0 disables decay).
    #[serde(default)]
    pub neg_expiration_secs: u64,

    /// Price factors applied to the positive balance of new connections.
    #[serde(default = "default_factors")]
    #[validate(custom(function = validation::validate_price_factors))]
    pub pos_factors: PriceFactorsConfig,

    /// Price factors applied to the negative balance of new connections.
    #[serde(default = "default_factors")]
    #[validate(custom(function = validation::validate_price_factors))]
    pub neg_factors: PriceFactorsConfig,

    /// Positive balances at or below this amount are not persisted.
    #[serde(default = "default_threshold")]
    pub pos_persist_threshold: u64,

    /// Negative balances at or below this amount are not persisted.
    #[serde(default = "default_threshold")]
    pub neg_persist_threshold: u64,

    /// Interval between periodic flushes of live balances, in seconds.
    #[serde(default = "default_flush_interval")]
    #[validate(range(min = 1, max = 86400))]
    pub flush_interval_secs: u64,
}

fn default_factors() -> PriceFactorsConfig {
    PriceFactorsConfig {
        time_factor: 0.0,
        capacity_factor: 0.0,
        request_factor: 1.0,
    }
}

fn default_threshold() -> u64 {
    1_000_000
}

fn default_flush_interval() -> u64 {
    300
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            pos_expiration_secs: 0,
            neg_expiration_secs: 0,
            pos_factors: default_factors(),
            neg_factors: default_factors(),
            pos_persist_threshold: default_threshold(),
            neg_persist_threshold: default_threshold(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_factor_fails_validation() {
        let mut config = TrackerConfig::default();
        config.neg_factors.capacity_factor = -0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_flush_interval_fails_validation() {
        let config = TrackerConfig {
            flush_interval_secs: 0,
            ..TrackerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: TrackerConfig = serde_yaml::from_str("pos_expiration_secs: 3600\n").unwrap();
        assert_eq!(config.pos_expiration_secs, 3600);
        assert_eq!(config.pos_persist_threshold, 1_000_000);
        assert_eq!(config.flush_interval_secs, 300);
        assert_eq!(config.pos_factors.request_factor, 1.0);
    }
}
