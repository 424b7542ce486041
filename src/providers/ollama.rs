//! Ollama provider implementation
//!
//! Streams `/api/generate`, which answers with one JSON object per line.

use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{Fragment, FragmentStream, ProviderError};

pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    pub async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream, ProviderError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidResponse(format!(
                "{}: {}",
                status, body
            )));
        }

        tracing::debug!(model = %self.model, prompt_len = prompt.len(), "ollama stream opened");

        Ok(Box::pin(decode_lines(response.bytes_stream())))
    }
}

/// Split a byte stream into NDJSON lines and decode each one
fn decode_lines<S, B>(body: S) -> impl Stream<Item = Result<Fragment, ProviderError>> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    async_stream::try_stream! {
        let mut body = Box::pin(body);
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(chunk?.as_ref());
            // Chunks may split a line (or a UTF-8 sequence) anywhere.
            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                if let Some(fragment) = parse_line(&line)? {
                    yield fragment;
                }
            }
        }
        if let Some(fragment) = parse_line(&buffer)? {
            yield fragment;
        }
    }
}

/// Decode one NDJSON line; blank lines yield nothing
fn parse_line(line: &[u8]) -> Result<Option<Fragment>, ProviderError> {
    let line = std::str::from_utf8(line)
        .map_err(|e| ProviderError::InvalidResponse(format!("non-UTF-8 chunk: {}", e)))?
        .trim();
    if line.is_empty() {
        return Ok(None);
    }

    let chunk: GenerateChunk = serde_json::from_str(line)
        .map_err(|e| ProviderError::InvalidResponse(format!("{} - Line: {}", e, line)))?;

    if let Some(error) = chunk.error {
        return Err(ProviderError::Stream(error));
    }

    Ok(Some(Fragment::new(chunk.response, chunk.done)))
}
