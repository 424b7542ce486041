//! Session configuration loaded from TOML files
//!
//! A session file defines:
//! - Which user the conversation history belongs to
//! - The inference provider and model
//! - Where history records are written
//! - The power profile used for energy estimates

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub user: UserConfig,

    /// Inference provider settings
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub energy: EnergyConfig,
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Validation("llm.model must not be empty".into()));
        }
        if let Some(power) = self.energy.cpu_active_mah_per_sec {
            if !power.is_finite() || power < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "energy.cpu_active_mah_per_sec must be a non-negative number, got {}",
                    power
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Owner of the history file
    #[serde(default = "default_username")]
    pub name: String,
}

fn default_username() -> String {
    "default".to_string()
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            name: default_username(),
        }
    }
}

/// Inference provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name: "ollama"
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Custom API endpoint
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    "llama3.2".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            endpoint: None,
        }
    }
}

/// History log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Overrides `<data dir>/history`
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

/// Device power profile
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnergyConfig {
    /// Average CPU draw while active, in mAh per second
    #[serde(default)]
    pub cpu_active_mah_per_sec: Option<f64>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
