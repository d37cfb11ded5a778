//! Configuration file loading for Runcell
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, File, FileFormat};

use crate::config::{Config, ConfigError};
use crate::types::ExecutionConfig;

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.cgroup_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cgroup_root is empty".to_string()));
        }
        if self.safety_net_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "safety_net_multiplier must be at least 1".to_string(),
            ));
        }
        if self.default_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_deadline_ms must be positive".to_string(),
            ));
        }
        if self.system_path.is_empty() {
            return Err(ConfigError::Invalid("system_path is empty".to_string()));
        }

        Ok(())
    }
}

impl ExecutionConfig {
    /// Load an execution config from a JSON, TOML or YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => FileFormat::Json,
            Some("toml") => FileFormat::Toml,
            Some("yaml" | "yml") => FileFormat::Yaml,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };

        let config = ConfigBuilder::builder()
            .add_source(File::from(path).format(format))
            .build()?;

        let config: ExecutionConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse an execution config from JSON
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: ExecutionConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}
