//! Application configuration

pub mod session;

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use session::{ConfigError, SessionConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub ollama_url: Option<String>,
    /// Optional TOML session file
    pub config_path: Option<PathBuf>,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            ollama_url: env::var("OLLAMA_URL").ok(),
            config_path: env::var("PARLEY_CONFIG").ok().map(PathBuf::from),
            data_dir: env::var("PARLEY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
        })
    }

    /// Load the session file, or defaults when none is configured
    pub fn load_session(&self) -> Result<SessionConfig, ConfigError> {
        match &self.config_path {
            Some(path) => SessionConfig::from_file(path),
            None => Ok(SessionConfig::default()),
        }
    }

    /// Directory holding per-user history files
    pub fn history_dir(&self, session: &SessionConfig) -> PathBuf {
        session
            .history
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("history"))
    }
}
