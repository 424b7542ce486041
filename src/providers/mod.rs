//! Inference backend integrations
//!
//! A backend turns a prompt into a lazy, sequentially consumed stream of
//! [`Fragment`]s. The last fragment of a successful response has `done` set.

mod ollama;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::config::session::LlmConfig;
use crate::config::Config;

pub use ollama::OllamaProvider;

/// One incremental piece of generated text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub done: bool,
}

impl Fragment {
    pub fn new(text: impl Into<String>, done: bool) -> Self {
        Self {
            text: text.into(),
            done,
        }
    }
}

pub type FragmentStream = BoxStream<'static, Result<Fragment, ProviderError>>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The backend reported a failure mid-stream
    #[error("{0}")]
    Stream(String),
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Open a response stream for `prompt`
    async fn start_stream(&self, prompt: &str) -> Result<FragmentStream, ProviderError>;
}

pub enum Provider {
    Ollama(OllamaProvider),
}

impl Provider {
    /// Build the provider named in the session file; a session endpoint
    /// takes precedence over `OLLAMA_URL`.
    pub fn from_settings(llm: &LlmConfig, config: &Config) -> Result<Self, ProviderError> {
        match llm.provider.to_lowercase().as_str() {
            "ollama" => {
                if llm.model.trim().is_empty() {
                    return Err(ProviderError::NotConfigured("ollama model".into()));
                }
                let url = llm
                    .endpoint
                    .clone()
                    .or_else(|| config.ollama_url.clone())
                    .unwrap_or_else(|| "http://localhost:11434".into());
                Ok(Provider::Ollama(OllamaProvider::new(url, &llm.model)))
            }
            other => Err(ProviderError::UnknownProvider(other.to_string())),
        }
    }
}

#[async_trait]
impl InferenceBackend for Provider {
    async fn start_stream(&self, prompt: &str) -> Result<FragmentStream, ProviderError> {
        match self {
            Provider::Ollama(p) => p.generate_stream(prompt).await,
        }
    }
}
