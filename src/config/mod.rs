//! Driver configuration
//!
//! Configuration is read from a YAML file (optional) and then overridden from
//! `MINIBATCH_*` environment variables. The host-provided
//! `AZUREML_BI_OUTPUT_PATH` is used as output root when nothing else sets one.

mod loader;

pub use loader::ConfigLoader;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::PipelineSpec;

/// Configuration result type
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading configuration file
    #[error("Failed to read config file: {0}")]
    FileReadError(#[from] std::io::Error),

    /// YAML parsing error
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Validation error
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Top-level driver configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Worker directories and concurrency
    pub worker: WorkerSettings,

    /// External pipeline contract
    pub pipeline: PipelineSpec,

    /// Dataset name -> local directory, for [`crate::resources::LocalDirectoryRegistry`]
    pub datasets: HashMap<String, PathBuf>,

    /// Log output
    pub logging: LoggingSettings,
}

/// Worker directories and concurrency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Host-designated root that receives relocated artifacts
    pub output_root: Option<PathBuf>,

    /// Worker-local root holding one working area per item
    pub worker_output_root: PathBuf,

    /// Items run at the same time within one mini-batch
    pub concurrency_limit: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            output_root: None,
            worker_output_root: PathBuf::from("outputs"),
            concurrency_limit: 1,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive, e.g. `info` or `minibatch=debug`
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl DriverConfig {
    /// Load from an optional YAML file with environment overrides
    pub fn load(path: Option<impl AsRef<Path>>) -> ConfigResult<Self> {
        ConfigLoader::new().load(path)
    }

    /// Host output root; required once the configuration is validated
    pub fn output_root(&self) -> ConfigResult<&Path> {
        self.worker.output_root.as_deref().ok_or_else(|| {
            ConfigError::ValidationError(
                "worker.output_root is not set (set MINIBATCH_OUTPUT_ROOT or AZUREML_BI_OUTPUT_PATH)"
                    .to_string(),
            )
        })
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> ConfigResult<()> {
        self.output_root()?;

        if self.worker.concurrency_limit == 0 {
            return Err(ConfigError::ValidationError(
                "worker.concurrency_limit must be at least 1".to_string(),
            ));
        }

        if self.pipeline.script.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "pipeline.script must not be empty".to_string(),
            ));
        }

        let artifact = Path::new(&self.pipeline.artifact_filename);
        if self.pipeline.artifact_filename.is_empty()
            || artifact.components().count() != 1
            || artifact.file_name().is_none()
        {
            return Err(ConfigError::ValidationError(format!(
                "pipeline.artifact_filename must be a plain file name, got {:?}",
                self.pipeline.artifact_filename
            )));
        }

        Ok(())
    }
}

/// Serialize `Option<Duration>` as whole seconds
pub(crate) mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn valid() -> DriverConfig {
        let mut config = DriverConfig::default();
        config.worker.output_root = Some(PathBuf::from("/host/out"));
        config
    }

    #[test]
    fn test_defaults_match_pipeline_contract() {
        let config = DriverConfig::default();
        assert_eq!(config.worker.concurrency_limit, 1);
        assert_eq!(config.pipeline.artifact_filename, "t000.e2e.pdb");
        assert_eq!(config.pipeline.interpreter, Some(PathBuf::from("/bin/sh")));
        assert!(config.pipeline.timeout.is_none());
    }

    #[test]
    fn test_validate_requires_output_root() {
        assert!(matches!(
            DriverConfig::default().validate(),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = valid();
        config.worker.concurrency_limit = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.pipeline.artifact_filename = "nested/t000.e2e.pdb".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
worker:
  output_root: /host/out
  concurrency_limit: 2
pipeline:
  script: ./run.sh
  timeout: 3600
datasets:
  rosettafold_pdb: /data/pdb
logging:
  level: debug
"#;
        let config: DriverConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.worker.concurrency_limit, 2);
        assert_eq!(config.worker.worker_output_root, PathBuf::from("outputs"));
        assert_eq!(config.pipeline.script, PathBuf::from("./run.sh"));
        assert_eq!(config.pipeline.timeout, Some(Duration::from_secs(3600)));
        assert_eq!(config.pipeline.artifact_filename, "t000.e2e.pdb");
        assert_eq!(config.datasets["rosettafold_pdb"], PathBuf::from("/data/pdb"));
        assert_eq!(config.logging.level, "debug");
    }
}
