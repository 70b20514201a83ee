//! Configuration Loader
//!
//! Environment-aware configuration loading. Resolves the configuration file, layers
//! environment overrides on top and validates the result before anything connects.

use super::error::{ConfigResult, ConfigurationError};
use super::AppConfig;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const ENV_PREFIX: &str = "BROKER";
const ENV_SEPARATOR: &str = "__";
const DEFAULT_CONFIG_PATH: &str = "config/broker.toml";

/// Loaded, validated configuration plus the context it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: AppConfig,
    environment: String,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        let path = env::var("BROKER_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from_sources(Some(&path), None)
    }

    /// Load from an explicit file and, optionally, an explicit environment map
    ///
    /// Passing `Some(env_map)` replaces the process environment as the override source,
    /// which keeps tests independent of global state.
    pub fn load_from_sources(
        config_path: Option<&Path>,
        env_overrides: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        let mut builder = config::Config::builder();

        let existing_path = config_path.filter(|p| p.exists()).map(Path::to_path_buf);
        if let Some(path) = &existing_path {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        } else if let Some(path) = config_path {
            debug!(path = %path.display(), "Configuration file not found, using defaults");
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env_overrides),
        );

        let config: AppConfig = builder
            .build()
            .map_err(|e| {
                ConfigurationError::load_failed(
                    existing_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "environment".to_string()),
                    e.to_string(),
                )
            })?
            .try_deserialize()?;

        config.validate()?;

        info!(
            environment = %environment,
            rabbitmq_url = %config.rabbitmq.url_redacted(),
            management_base_url = %config.management.base_url,
            min_threshold = config.aggregation.min_threshold,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment,
            config_path: existing_path,
        }))
    }

    /// Wrap an already-built configuration (tests, embedded use)
    pub fn from_config(config: AppConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_path: None,
        }))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// File the configuration was read from, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn detect_environment() -> String {
        env::var("BROKER_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }
}
