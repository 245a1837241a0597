//! Configuration loading and environment variable handling

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{ConfigError, ConfigResult, DriverConfig};

/// Output root variable set by the batch-scheduling host
pub const HOST_OUTPUT_ROOT_VAR: &str = "AZUREML_BI_OUTPUT_PATH";

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
    /// Fixed variable table; the process environment is used when absent
    vars: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "MINIBATCH".to_string(),
            vars: None,
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            vars: None,
        }
    }

    /// Read variables from a fixed table instead of the process environment
    pub fn with_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.vars = Some(vars);
        self
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<DriverConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: DriverConfig = serde_yaml::from_str(&content)?;
        self.finish(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<DriverConfig> {
        self.finish(DriverConfig::default())
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<DriverConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    fn finish(&self, mut config: DriverConfig) -> ConfigResult<DriverConfig> {
        self.apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&self, config: &mut DriverConfig) -> ConfigResult<()> {
        if let Some(root) = self.get_env_var("OUTPUT_ROOT") {
            config.worker.output_root = Some(PathBuf::from(root));
        }

        if config.worker.output_root.is_none() {
            if let Some(root) = self.get_raw_var(HOST_OUTPUT_ROOT_VAR) {
                config.worker.output_root = Some(PathBuf::from(root));
            }
        }

        if let Some(root) = self.get_env_var("WORKER_OUTPUT_ROOT") {
            config.worker.worker_output_root = PathBuf::from(root);
        }

        if let Some(limit) = self.get_env_var("CONCURRENCY") {
            config.worker.concurrency_limit = if limit.eq_ignore_ascii_case("auto") {
                num_cpus::get()
            } else {
                limit
                    .parse()
                    .map_err(|e| ConfigError::EnvError(format!("Invalid CONCURRENCY: {}", e)))?
            };
        }

        if let Some(timeout) = self.get_env_var("ITEM_TIMEOUT_SECONDS") {
            let seconds: u64 = timeout.parse().map_err(|e| {
                ConfigError::EnvError(format!("Invalid ITEM_TIMEOUT_SECONDS: {}", e))
            })?;
            config.pipeline.timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
        }

        if let Some(level) = self.get_env_var("LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(())
    }

    fn get_env_var(&self, key: &str) -> Option<String> {
        self.get_raw_var(&format!("{}_{}", self.prefix, key))
    }

    fn get_raw_var(&self, key: &str) -> Option<String> {
        match &self.vars {
            Some(vars) => vars.get(key).cloned(),
            None => std::env::var(key).ok(),
        }
        .filter(|value| !value.is_empty())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
