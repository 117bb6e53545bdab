use credence_config::PriceFactorsConfig;
use serde::{Deserialize, Serialize};

/// Largest amount either balance may hold.
pub const MAX_BALANCE: u64 = i64::MAX as u64;

/// Linear weights turning connected time, capacity and request cost into
/// balance debits for one polarity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceFactors {
    pub time_factor: f64,
    pub capacity_factor: f64,
    pub request_factor: f64,
}

impl PriceFactors {
    pub const fn new(time_factor: f64, capacity_factor: f64, request_factor: f64) -> Self {
        Self {
            time_factor,
            capacity_factor,
            request_factor,
        }
    }

    /// Cost of one nanosecond of connection at `capacity`.
    #[inline]
    pub fn time_price(&self, capacity: u64) -> f64 {
        self.time_factor + self.capacity_factor * capacity as f64
    }
}

impl From<PriceFactorsConfig> for PriceFactors {
    fn from(config: PriceFactorsConfig) -> Self {
        Self::new(
            config.time_factor,
            config.capacity_factor,
            config.request_factor,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_price_scales_with_capacity() {
        let factors = PriceFactors::new(2.0, 0.5, 1.0);
        assert_eq!(factors.time_price(0), 2.0);
        assert_eq!(factors.time_price(10), 7.0);
    }

    #[test]
    fn converts_from_config() {
        let factors = PriceFactors::from(PriceFactorsConfig {
            time_factor: 1.0,
            capacity_factor: 0.0,
            request_factor: 3.0,
        });
        assert_eq!(factors, PriceFactors::new(1.0, 0.0, 3.0));
    }
}
