//! Failures of [`CredenceConfig`](crate::CredenceConfig) loading.

use std::fmt::Write;
use std::path::PathBuf;

use thiserror::Error;
use validator::{ValidationErrors, ValidationErrorsKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("configuration file {} does not exist", .0.display())]
    MissingFile(PathBuf),

    /// A source could not be read or does not fit the schema.
    #[error("cannot read configuration: {0}")]
    Extract(#[from] Box<figment::Error>),

    /// The values were read but break a constraint.
    #[error("invalid configuration: {}", describe(.0))]
    Invalid(#[from] ValidationErrors),
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        ConfigError::Extract(Box::new(error))
    }
}

/// Flattens nested section errors into `section.field: code` entries.
fn describe(errors: &ValidationErrors) -> String {
    let mut entries = Vec::new();
    collect(errors, "", &mut entries);
    entries.sort();
    entries.join(", ")
}

fn collect(errors: &ValidationErrors, prefix: &str, entries: &mut Vec<String>) {
    for (field, kind) in errors.errors() {
        let path = format!("{prefix}{field}");
        match kind {
            ValidationErrorsKind::Field(failures) => {
                for failure in failures {
                    let mut entry = format!("{path}: {}", failure.code);
                    if let Some(message) = &failure.message {
                        let _ = write!(entry, " ({message})");
                    }
                    entries.push(entry);
                }
            }
            ValidationErrorsKind::Struct(nested) => collect(nested, &format!("{path}."), entries),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect(nested, &format!("{path}[{index}]."), entries);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CredenceConfig;
    use validator::Validate;

    #[test]
    fn nested_failures_name_their_section() {
        let mut config = CredenceConfig::default();
        config.tracker.neg_factors.request_factor = f64::NAN;
        config.telemetry.log_level = "loud".into();

        let err = ConfigError::from(config.validate().unwrap_err());
        let text = err.to_string();
        assert!(text.contains("tracker.neg_factors: invalid_price_factor"), "{text}");
        assert!(text.contains("telemetry.log_level: invalid_log_level"), "{text}");
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = ConfigError::MissingFile(PathBuf::from("conf/absent.yaml"));
        assert_eq!(
            err.to_string(),
            "configuration file conf/absent.yaml does not exist"
        );
    }
}
