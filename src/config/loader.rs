//! Configuration Loader
//!
//! Environment-aware configuration loading. Reads `kernel.toml` from the
//! configuration directory, deep-merges `environments/{env}/kernel.toml` on top
//! when present, deserializes into [`KernelConfig`] and validates the result.
//!
//! ## Deep Merge Semantics
//!
//! - **Tables**: recursively merged, keys from both sides preserved
//! - **Scalars and arrays**: overlay replaces base
//! - **New keys**: keys only in the overlay are inserted

use super::error::{ConfigResult, ConfigurationError};
use super::KernelConfig;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CONFIG_FILE_NAME: &str = "kernel.toml";

/// Loaded configuration plus the context it was loaded from
#[derive(Debug)]
pub struct ConfigManager {
    config: KernelConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Useful for tests that should not touch process environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = %environment,
            config_directory = %config_directory.display(),
            "Loading kernel configuration"
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = %environment,
            breakers = config.circuit_breakers.components.len(),
            queues = config.backpressure.queues.len(),
            window_size = config.anomaly_detection.window_size,
            "⚙️ Kernel configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration (tests, embedding hosts)
    pub fn from_config(config: KernelConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Detect current environment: KERNEL_ENV || APP_ENV || 'development'
    pub fn detect_environment() -> String {
        resolve_environment(env::var("KERNEL_ENV").ok(), env::var("APP_ENV").ok())
    }

    fn default_config_directory() -> PathBuf {
        env::var("KERNEL_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn read_config_file_safely(path: &Path) -> ConfigResult<String> {
        const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

        let metadata = std::fs::metadata(path)
            .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))?;

        if !metadata.is_file() {
            return Err(ConfigurationError::invalid_value(
                "file_type",
                path.display(),
                "configuration path must point to a regular file",
            ));
        }

        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigurationError::invalid_value(
                "file_size",
                metadata.len(),
                "configuration file exceeds 1MB",
            ));
        }

        std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))
    }

    fn parse_toml_file(path: &Path) -> ConfigResult<toml::Value> {
        let content = Self::read_config_file_safely(path)?;
        toml::from_str(&content)
            .map_err(|e| ConfigurationError::invalid_toml(path.display().to_string(), e))
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<KernelConfig> {
        let base_path = config_directory.join(CONFIG_FILE_NAME);
        if !base_path.exists() {
            return Err(ConfigurationError::config_file_not_found(vec![base_path]));
        }

        let mut merged = Self::parse_toml_file(&base_path)?;

        let overlay_path = config_directory
            .join("environments")
            .join(environment)
            .join(CONFIG_FILE_NAME);
        if overlay_path.exists() {
            debug!(
                environment = %environment,
                overlay = %overlay_path.display(),
                "Applying environment-specific overrides"
            );
            let overlay = Self::parse_toml_file(&overlay_path)?;
            deep_merge_toml(&mut merged, overlay)?;
        }

        merged
            .try_into::<KernelConfig>()
            .map_err(|e| ConfigurationError::deserialization_error(environment, e))
    }
}

fn resolve_environment(kernel_env: Option<String>, app_env: Option<String>) -> String {
    kernel_env
        .filter(|value| !value.is_empty())
        .or(app_env.filter(|value| !value.is_empty()))
        .unwrap_or_else(|| "development".to_string())
        .to_lowercase()
}

/// Deep merge `overlay` into `base`
pub fn deep_merge_toml(base: &mut toml::Value, overlay: toml::Value) -> ConfigResult<()> {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            deep_merge_tables(base_table, overlay_table);
            Ok(())
        }
        (toml::Value::Table(_), other) => Err(ConfigurationError::ConfigMergeError {
            error: format!("overlay root must be a table, found {}", other.type_str()),
        }),
        (base_value, overlay_value) => {
            *base_value = overlay_value;
            Ok(())
        }
    }
}

fn deep_merge_tables(base: &mut toml::value::Table, overlay: toml::value::Table) {
    for (key, overlay_value) in overlay {
        match (base.get_mut(&key), overlay_value) {
            (Some(toml::Value::Table(base_nested)), toml::Value::Table(overlay_nested)) => {
                deep_merge_tables(base_nested, overlay_nested);
            }
            (_, overlay_value) => {
                base.insert(key, overlay_value);
            }
        }
    }
}
