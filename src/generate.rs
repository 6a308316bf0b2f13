//! Answer generation through an OpenAI-compatible chat completions API.
//!
//! Generation is optional: [`create_generator`] returns `None` when the
//! provider is disabled or `OPENAI_API_KEY` is not set, and the retrieval
//! flow then answers in retrieval-only mode.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use repo_guide_core::error::GenerationError;
use repo_guide_core::generate::{grounded_prompt, Generator, GROUNDING_INSTRUCTION};

use crate::config::GenerationConfig;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig, api_key: String) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout,
        })
    }

    fn request_body(&self, context: &str, question: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [
                {"role": "system", "content": GROUNDING_INSTRUCTION},
                {"role": "user", "content": grounded_prompt(context, question)},
            ],
        })
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, context: &str, question: &str) -> Result<String, GenerationError> {
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(context, question))
            .send();

        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) if e.is_timeout() => return Err(GenerationError::Timeout(self.timeout)),
            Ok(Err(e)) => return Err(GenerationError::Request(e.to_string())),
            Err(_) => return Err(GenerationError::Timeout(self.timeout)),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Request(format!("invalid response: {}", e)))?;
        parse_chat_response(&json)
    }
}

/// First choice's message content, trimmed.
fn parse_chat_response(json: &serde_json::Value) -> Result<String, GenerationError> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::trim)
        .unwrap_or_default();
    if content.is_empty() {
        return Err(GenerationError::Empty);
    }
    Ok(content.to_string())
}

/// The configured generator, or `None` for retrieval-only mode.
pub fn create_generator(config: &GenerationConfig) -> Result<Option<Box<dyn Generator>>> {
    create_generator_with_key(config, std::env::var("OPENAI_API_KEY").ok())
}

fn create_generator_with_key(
    config: &GenerationConfig,
    api_key: Option<String>,
) -> Result<Option<Box<dyn Generator>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => match api_key.filter(|k| !k.trim().is_empty()) {
            Some(key) => Ok(Some(Box::new(OpenAiGenerator::new(config, key)?))),
            None => {
                info!("OPENAI_API_KEY not set; answering in retrieval-only mode");
                Ok(None)
            }
        },
        other => anyhow::bail!("Unknown generation provider: {}", other),
    }
}
