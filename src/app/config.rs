//! Application configuration management

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::proxy::InterceptRule;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Interception settings
    pub intercept: InterceptConfig,

    /// Playback settings
    pub playback: PlaybackConfig,

    /// Scripting settings
    pub scripting: ScriptingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Maximum flows kept in memory (0 for unbounded)
    pub max_flows: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Global intercept switch
    pub enabled: bool,

    /// Rules deciding which messages pause
    pub rules: Vec<InterceptRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Dump whose responses answer matching requests
    pub server_replay: Option<PathBuf>,

    /// Kill requests with no recorded match while server playback is active
    pub kill_extra: bool,

    /// Dump whose requests are re-issued
    pub client_replay: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptingConfig {
    /// Script run on every request
    pub request: Option<PathBuf>,

    /// Script run on every response
    pub response: Option<PathBuf>,

    /// Script run on every error
    pub error: Option<PathBuf>,
}

impl Config {
    /// Load configuration from file, falling back to defaults if absent
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_config_path() {
                Some(p) => p,
                None => {
                    tracing::info!("No configuration directory, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !config_path.exists() {
            tracing::info!("No configuration file found, using defaults");
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&config_path).map_err(|source| ConfigError::ReadError {
                path: config_path.display().to_string(),
                source,
            })?;
        let config = Self::from_toml(&contents)?;
        tracing::info!("Loaded configuration from {:?}", config_path);
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, rule) in self.intercept.rules.iter().enumerate() {
            if let Some(pattern) = &rule.url_pattern {
                regex::Regex::new(pattern).map_err(|e| ConfigError::ValidationError {
                    field: format!("intercept.rules[{}].url_pattern", index),
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "flowtap", "flowtap")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get data directory path
    pub fn data_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "flowtap", "flowtap")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }
}
