//! LLM client seam and the default HTTP-backed implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{Error, Result};

/// The one operation the pipeline needs from a language model. Injected at
/// orchestrator construction so providers stay swappable and tests can
/// script responses.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// Anthropic-messages-shaped HTTP client.
#[derive(Debug)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_tokens: u32,
}

impl HttpLlmClient {
    /// Build from config. The key falls back to `ANTHROPIC_API_KEY` when the
    /// config omits it.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .ok_or_else(|| {
                Error::Configuration("llm.api_key is not set and ANTHROPIC_API_KEY is unset".into())
            })?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Configuration(format!("llm http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![Message { role: "user", content: prompt }],
        };
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::PromptGeneration(format!("llm request: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::PromptGeneration(format!("llm returned {status}: {body}")));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| Error::PromptGeneration(format!("llm response decode: {e}")))?;
        let text = parsed
            .content
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(Error::PromptGeneration("llm produced empty content".into()));
        }
        tracing::debug!(target = "llm", chars = text.len(), "generation complete");
        Ok(text)
    }
}
