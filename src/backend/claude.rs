//! Anthropic Messages API backend.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use super::{http_client, reject, LanguageModelBackend};
use crate::config::LlmConfig;
use crate::conversation::Turn;
use crate::error::{BackendError, PipelineError};

pub struct ClaudeBackend {
    api_url: String,
    api_key: String,
    api_version: String,
    model: String,
    max_tokens: u32,
    client: Client,
}

impl ClaudeBackend {
    pub fn new(config: &LlmConfig) -> Result<Self, PipelineError> {
        let api_key = config.resolve_api_key()?;
        Ok(Self {
            api_url: config.api_url.clone(),
            api_key,
            api_version: config.api_version.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            client: http_client(config.timeout())?,
        })
    }
}

#[async_trait]
impl LanguageModelBackend for ClaudeBackend {
    fn name(&self) -> &str {
        "claude"
    }

    async fn generate(&self, messages: &[Turn], system_prompt: &str) -> Result<String, BackendError> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": messages,
            "system": system_prompt,
        });

        debug!("Sending {} messages to Claude model '{}'", messages.len(), self.model);

        let resp = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!("Claude request failed: {e}");
                BackendError::from_reqwest(e)
            })?;

        if !resp.status().is_success() {
            let err = reject(resp).await;
            warn!("Claude returned error: {err}");
            return Err(err);
        }

        let data: serde_json::Value = resp.json().await.map_err(|e| {
            warn!("Failed to parse Claude response: {e}");
            BackendError::MalformedPayload(e.to_string())
        })?;

        // Replies arrive as a list of content blocks; join the text blocks.
        let blocks = data["content"]
            .as_array()
            .ok_or_else(|| BackendError::MalformedPayload("missing content array".into()))?;
        let text: String = blocks
            .iter()
            .filter(|b| b["type"].as_str().unwrap_or("text") == "text")
            .filter_map(|b| b["text"].as_str())
            .collect();

        if text.is_empty() {
            return Err(BackendError::MalformedPayload("no text content in reply".into()));
        }
        Ok(text)
    }
}
