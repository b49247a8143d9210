//! Backend configuration
//!
//! Sources are applied in order, later ones winning:
//! 1. Default values
//! 2. A TOML file or in-memory TOML string
//! 3. Environment variables (`CHIP_PLATFORM`, `CHIP_DEVICE_TYPE`,
//!    `CHIP_DEVICE`, `CHIP_LOG_LEVEL`, `CHIP_LOG_FORMAT`)
//!
//! ```toml
//! platform = "0"
//! device_type = "gpu"
//! device = "all"
//!
//! [log]
//! level = "debug"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogConfig;
use crate::selector::{DeviceSelector, DeviceTypeSelector, PlatformSelector};

/// Default environment variable prefix
pub const ENV_PREFIX: &str = "CHIP";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid value
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Field name
        field: String,
        /// Error message
        message: String,
    },

    /// Subscriber installation failed
    #[error("Logging error: {0}")]
    Logging(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Device selection and logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Platform selector
    pub platform: String,
    /// Device type selector
    pub device_type: String,
    /// Device selector
    pub device: String,
    /// Logging
    pub log: LogConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            platform: "default".to_string(),
            device_type: "gpu".to_string(),
            device: "default".to_string(),
            log: LogConfig::default(),
        }
    }
}

impl BackendConfig {
    /// Check that every selector parses
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.platform
            .parse::<PlatformSelector>()
            .map_err(|e| ConfigError::invalid("platform", e.to_string()))?;
        self.device_type
            .parse::<DeviceTypeSelector>()
            .map_err(|e| ConfigError::invalid("device_type", e.to_string()))?;
        self.device
            .parse::<DeviceSelector>()
            .map_err(|e| ConfigError::invalid("device", e.to_string()))?;
        if self.log.output == crate::logging::LogOutput::File && self.log.file_path.is_none() {
            return Err(ConfigError::invalid("log.file_path", "file output requires a path"));
        }
        Ok(())
    }
}

/// Configuration source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Built-in defaults
    Default,
    /// TOML file
    File(PathBuf),
    /// TOML string
    Memory(String),
    /// Environment variables
    Env,
}

/// Loads [`BackendConfig`] from layered sources
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: String,
}

impl ConfigLoader {
    /// A loader that only yields defaults
    pub fn new() -> Self {
        Self {
            sources: vec![ConfigSource::Default],
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    /// Add a TOML file source
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.sources
            .push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add an in-memory TOML source
    pub fn with_str(mut self, toml: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Memory(toml.into()));
        self
    }

    /// Add environment overrides read with `prefix`
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = prefix.to_string();
        self.sources.push(ConfigSource::Env);
        self
    }

    /// Apply every source and validate the result
    pub fn load(&self) -> Result<BackendConfig, ConfigError> {
        self.load_with(|key| std::env::var(key).ok())
    }

    fn load_with(&self, env: impl Fn(&str) -> Option<String>) -> Result<BackendConfig, ConfigError> {
        let mut config = BackendConfig::default();
        for source in &self.sources {
            match source {
                ConfigSource::Default => {}
                ConfigSource::File(path) => {
                    let content = std::fs::read_to_string(path)?;
                    config = Self::parse(&content)?;
                }
                ConfigSource::Memory(content) => {
                    config = Self::parse(content)?;
                }
                ConfigSource::Env => {
                    config = Self::apply_env_overrides(config, &self.env_prefix, &env)?;
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<BackendConfig, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_env_overrides(
        mut config: BackendConfig,
        prefix: &str,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<BackendConfig, ConfigError> {
        if let Some(val) = env(&format!("{prefix}_PLATFORM")) {
            config.platform = val;
        }
        if let Some(val) = env(&format!("{prefix}_DEVICE_TYPE")) {
            config.device_type = val;
        }
        if let Some(val) = env(&format!("{prefix}_DEVICE")) {
            config.device = val;
        }
        if let Some(val) = env(&format!("{prefix}_LOG_LEVEL")) {
            config.log.level = val.parse()?;
        }
        if let Some(val) = env(&format!("{prefix}_LOG_FORMAT")) {
            config.log.format = val.parse()?;
        }
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogFormat, LogLevel};
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config, BackendConfig::default());
        assert_eq!(config.device_type, "gpu");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "platform = \"1\"\ndevice_type = \"cpu\"\n\n[log]\nlevel = \"debug\"\nformat = \"json\""
        )
        .unwrap();

        let config = ConfigLoader::new().with_file(file.path()).load().unwrap();
        assert_eq!(config.platform, "1");
        assert_eq!(config.device_type, "cpu");
        assert_eq!(config.device, "default");
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = [("TEST_DEVICE_TYPE", "all"), ("TEST_LOG_LEVEL", "trace")]
            .into_iter()
            .collect();
        let config = ConfigLoader::new()
            .with_str("device_type = \"cpu\"")
            .with_env_prefix("TEST")
            .load_with(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.device_type, "all");
        assert_eq!(config.log.level, LogLevel::Trace);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ConfigLoader::new()
            .with_str("device_type = \"quantum\"")
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "device_type"));

        let err = ConfigLoader::new().with_str("platform = [").load().unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let env = |k: &str| (k == "CHIP_LOG_LEVEL").then(|| "loud".to_string());
        assert!(
            ConfigLoader::new()
                .with_env_prefix(ENV_PREFIX)
                .load_with(env)
                .is_err()
        );
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigLoader::new()
            .with_file("/nonexistent/chip.toml")
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
