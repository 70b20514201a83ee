//! Configuration error types

use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Failed to load configuration from {source_name}: {message}")]
    LoadFailed {
        source_name: String,
        message: String,
    },

    #[error("Invalid configuration value for '{field}' ({value}): {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingRequired { field: String },
}

impl ConfigurationError {
    pub fn load_failed(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LoadFailed {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_required(field: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        ConfigurationError::load_failed("config", err.to_string())
    }
}

impl From<ConfigurationError> for crate::error::BrokerError {
    fn from(err: ConfigurationError) -> Self {
        crate::error::BrokerError::configuration("config", err.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
