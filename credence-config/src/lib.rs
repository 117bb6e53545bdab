//! # Credence Configuration System
//!
//! Hierarchical configuration for the balance tracker and its ambient
//! services.
//!
//! ## Features
//! - **Unified Configuration**: Single source of truth for tracker economics and telemetry
//! - **Validation**: Runtime validation of price factors, intervals and log levels
//! - **Environment Awareness**: Per-environment override files and `CREDENCE_*` variables

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod error;
mod telemetry;
mod tracker;
mod validation;

pub use error::ConfigError;
pub use telemetry::TelemetryConfig;
pub use tracker::PriceFactorsConfig;
pub use tracker::TrackerConfig;

/// Top-level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone)]
pub struct CredenceConfig {
    /// Balance tracker economics and persistence.
    #[validate(nested)]
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Logging and metrics.
    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl CredenceConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default values
    /// 2. `config/credence.yaml`, if present
    /// 3. `config/<CREDENCE_ENV>.yaml` environment overrides
    /// 4. `CREDENCE_*` environment variables (`__` separates sections)
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(CredenceConfig::default()));

        if Path::new("config/credence.yaml").exists() {
            figment = figment.merge(Yaml::file("config/credence.yaml"));
        }

        let env = std::env::var("CREDENCE_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::extract(figment.merge(Env::prefixed("CREDENCE_").split("__")))
    }

    /// Load configuration from a specific path, still honouring environment overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::MissingFile(PathBuf::from(path)));
        }

        Self::extract(
            Figment::from(Serialized::defaults(CredenceConfig::default()))
                .merge(Yaml::file(path))
                .merge(Env::prefixed("CREDENCE_").split("__")),
        )
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_validation() {
        let config = CredenceConfig::default();
        config.validate().expect("Default config should validate");
    }

    #[test]
    fn missing_file_is_reported() {
        let err = CredenceConfig::load_from_path("does/not/exist.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[test]
    fn environment_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CREDENCE_TRACKER__FLUSH_INTERVAL_SECS", "42");
            let config = CredenceConfig::load().unwrap();
            assert_eq!(config.tracker.flush_interval_secs, 42);
            Ok(())
        });
    }

    #[test]
    fn file_values_are_validated() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "credence.yaml",
                "tracker:\n  pos_factors:\n    time_factor: -3.0\n",
            )?;
            let err = CredenceConfig::load_from_path("credence.yaml").unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)));
            assert!(err.to_string().contains("tracker.pos_factors"), "{err}");
            Ok(())
        });
    }

    #[test]
    fn mistyped_file_values_fail_extraction() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("credence.yaml", "tracker:\n  flush_interval_secs: soon\n")?;
            let err = CredenceConfig::load_from_path("credence.yaml").unwrap_err();
            assert!(matches!(err, ConfigError::Extract(_)));
            Ok(())
        });
    }
}
