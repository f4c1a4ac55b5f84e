//! Configuration loading and validation for the mealmind assistant core.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Every field has a serde default, so an empty file (or no file at all) is a
//! valid configuration — except that a missing API key is surfaced later by
//! the agent loop as a configuration error event, not here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Completion-provider API key (usually supplied via `MEALMIND_API_KEY`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model id sent to the completion provider
    #[serde(default = "default_model")]
    pub model: String,

    /// Maximum tokens per model response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Maximum tool-use iterations per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Session persistence settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Per-user rate limits
    #[serde(default)]
    pub rate: RateConfig,
}

/// Session persistence policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity hours after which a conversation expires
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u32,

    /// Maximum retained messages per conversation
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
}

/// Per-user sliding-window rate limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Requests allowed per user per minute
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,

    /// Requests allowed per user per day
    #[serde(default = "default_per_day")]
    pub per_day: u32,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_max_iterations() -> u32 {
    10
}
fn default_ttl_hours() -> u32 {
    8
}
fn default_max_messages() -> u32 {
    100
}
fn default_per_minute() -> u32 {
    10
}
fn default_per_day() -> u32 {
    200
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            max_messages: default_max_messages(),
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_day: default_per_day(),
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            max_iterations: default_max_iterations(),
            session: SessionConfig::default(),
            rate: RateConfig::default(),
        }
    }
}

impl AssistantConfig {
    /// Load configuration from a file, then apply environment overrides:
    /// `MEALMIND_API_KEY` and `MEALMIND_MODEL`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path)?;

        if let Ok(key) = std::env::var("MEALMIND_API_KEY") {
            if !key.is_empty() {
                config.api_key = Some(key);
            }
        }
        if let Ok(model) = std::env::var("MEALMIND_MODEL") {
            if !model.is_empty() {
                config.model = model;
            }
        }

        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Validation("max_iterations must be > 0".into()));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Validation("max_tokens must be > 0".into()));
        }
        if self.session.ttl_hours == 0 {
            return Err(ConfigError::Validation("session.ttl_hours must be > 0".into()));
        }
        if self.session.max_messages == 0 {
            return Err(ConfigError::Validation(
                "session.max_messages must be > 0".into(),
            ));
        }
        if self.rate.per_minute == 0 || self.rate.per_day == 0 {
            return Err(ConfigError::Validation("rate limits must be > 0".into()));
        }
        Ok(())
    }

    /// Whether a provider credential is available.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}
