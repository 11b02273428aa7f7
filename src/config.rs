//! Configuration module for cache, PSIS and fit settings.
//!
//! Handles YAML configuration loading. Every field has a default, so an empty
//! document is a valid configuration.

use crate::engine::{CmdStanConfig, EngineError};
use crate::model::FitOptions;
use crate::psis::PsisConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StanityConfig {
    /// Compiled-model cache
    #[serde(default)]
    pub cache: CacheSettings,
    /// PSIS constants
    #[serde(default)]
    pub psis: PsisConfig,
    /// Default sampler settings
    #[serde(default)]
    pub fit: FitOptions,
    /// Modeling engine location
    #[serde(default)]
    pub engine: EngineSettings,
}

/// Cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Directory holding compiled artifacts
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stanity")
        .join("models")
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

/// Engine settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// CmdStan installation; `$CMDSTAN` when absent
    #[serde(default)]
    pub cmdstan_home: Option<PathBuf>,
}

impl EngineSettings {
    /// Resolve the CmdStan configuration
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotConfigured` when neither the setting nor
    /// `$CMDSTAN` is present.
    pub fn cmdstan(&self) -> Result<CmdStanConfig, EngineError> {
        self.cmdstan_home
            .as_ref()
            .map_or_else(CmdStanConfig::from_env, |home| Ok(CmdStanConfig::new(home)))
    }
}

impl StanityConfig {
    /// Load configuration from YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed or fails validation.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot be used
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.psis
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.fit.chains == 0 {
            return Err(ConfigError::Invalid("fit.chains must be at least 1".to_string()));
        }
        if self.fit.iter == 0 {
            return Err(ConfigError::Invalid("fit.iter must be at least 1".to_string()));
        }
        if self.fit.parallel_chains == Some(0) {
            return Err(ConfigError::Invalid(
                "fit.parallel_chains must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
