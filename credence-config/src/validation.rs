//! Custom validation functions shared by the configuration sections.

use validator::ValidationError;

use crate::tracker::PriceFactorsConfig;

/// A price weight must be a finite, non-negative number.
pub fn validate_factor(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_price_factor"))
    }
}

/// Validate all three weights of a price factor set.
pub fn validate_price_factors(factors: &PriceFactorsConfig) -> Result<(), ValidationError> {
    validate_factor(factors.time_factor)?;
    validate_factor(factors.capacity_factor)?;
    validate_factor(factors.request_factor)
}

/// Validate a tracing filter level.
pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid = ["trace", "debug", "info", "warn", "error"]
        .contains(&level.to_lowercase().as_str());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative_and_nan_factors() {
        assert!(validate_factor(0.0).is_ok());
        assert!(validate_factor(2.5).is_ok());
        assert!(validate_factor(-1.0).is_err());
        assert!(validate_factor(f64::NAN).is_err());
        assert!(validate_factor(f64::INFINITY).is_err());
    }

    #[test]
    fn log_levels() {
        assert!(validate_log_level("INFO").is_ok());
        assert!(validate_log_level("verbose").is_err());
    }
}
