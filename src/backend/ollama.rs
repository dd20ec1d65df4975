//! Ollama chat backend for local models.
//!
//! Uses the non-streaming `/api/chat` endpoint. No API key is needed; the
//! configured `api_url` is the Ollama host, e.g. `http://localhost:11434`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use super::{http_client, reject, LanguageModelBackend};
use crate::config::LlmConfig;
use crate::conversation::Turn;
use crate::error::{BackendError, PipelineError};

pub struct OllamaBackend {
    host: String,
    model: String,
    max_tokens: u32,
    client: Client,
}

impl OllamaBackend {
    pub fn new(config: &LlmConfig) -> Result<Self, PipelineError> {
        if config.api_url.trim().is_empty() {
            return Err(PipelineError::Config("llm.api_url (Ollama host) is not set".into()));
        }
        Ok(Self {
            host: config.api_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            client: http_client(config.timeout())?,
        })
    }
}

#[async_trait]
impl LanguageModelBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, messages: &[Turn], system_prompt: &str) -> Result<String, BackendError> {
        let mut chat = Vec::with_capacity(messages.len() + 1);
        chat.push(json!({ "role": "system", "content": system_prompt }));
        chat.extend(messages.iter().map(|t| json!({ "role": t.role, "content": t.content })));

        let body = json!({
            "model": self.model,
            "messages": chat,
            "stream": false,
            "options": {
                "temperature": 0.7,
                "num_predict": self.max_tokens
            }
        });

        let url = format!("{}/api/chat", self.host);
        debug!("Sending {} messages to Ollama model '{}'", messages.len(), self.model);

        let resp = match self.client.post(&url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                if e.is_connect() {
                    warn!("Cannot connect to Ollama at {}", self.host);
                } else if e.is_timeout() {
                    warn!("Ollama request timed out");
                } else {
                    warn!("Ollama request failed: {e}");
                }
                return Err(BackendError::from_reqwest(e));
            }
        };

        if !resp.status().is_success() {
            warn!("Ollama returned status {}", resp.status());
            return Err(reject(resp).await);
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BackendError::MalformedPayload(e.to_string()))?;

        let result = data["message"]["content"].as_str().unwrap_or("").trim().to_string();
        if result.is_empty() {
            warn!("Ollama returned empty response");
            return Err(BackendError::MalformedPayload("empty message content".into()));
        }
        Ok(result)
    }
}
