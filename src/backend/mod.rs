//! Capability interfaces for the two outbound services, plus a name-keyed
//! registry that builds concrete backends from configuration.
//!
//! - `claude`: Anthropic Messages API
//! - `ollama`: local Ollama `/api/chat`
//! - `elevenlabs`: ElevenLabs streaming text-to-speech

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{LlmConfig, TtsConfig};
use crate::conversation::Turn;
use crate::error::{BackendError, PipelineError};

pub mod claude;
pub mod elevenlabs;
pub mod ollama;

pub use claude::ClaudeBackend;
pub use elevenlabs::ElevenLabsBackend;
pub use ollama::OllamaBackend;

/// Produces a complete reply for an ordered message list.
#[async_trait]
pub trait LanguageModelBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, messages: &[Turn], system_prompt: &str) -> Result<String, BackendError>;
}

/// Converts one unit of text into encoded audio.
#[async_trait]
pub trait SpeechSynthesisBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, BackendError>;
}

pub type LlmConstructor = fn(&LlmConfig) -> Result<Arc<dyn LanguageModelBackend>, PipelineError>;
pub type TtsConstructor = fn(&TtsConfig) -> Result<Arc<dyn SpeechSynthesisBackend>, PipelineError>;

#[derive(Default)]
pub struct BackendRegistry {
    llm: HashMap<String, LlmConstructor>,
    tts: HashMap<String, TtsConstructor>,
}

impl BackendRegistry {
    /// Empty registry; see `with_defaults` for the bundled backends.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_llm("claude", build_claude);
        registry.register_llm("ollama", build_ollama);
        registry.register_tts("elevenlabs", build_elevenlabs);
        registry
    }

    pub fn register_llm(&mut self, name: &str, constructor: LlmConstructor) {
        self.llm.insert(name.to_ascii_lowercase(), constructor);
    }

    pub fn register_tts(&mut self, name: &str, constructor: TtsConstructor) {
        self.tts.insert(name.to_ascii_lowercase(), constructor);
    }

    pub fn build_llm(&self, config: &LlmConfig) -> Result<Arc<dyn LanguageModelBackend>, PipelineError> {
        let constructor = self
            .llm
            .get(&config.provider.to_ascii_lowercase())
            .ok_or_else(|| PipelineError::UnknownBackend {
                kind: "language model",
                name: config.provider.clone(),
            })?;
        constructor(config)
    }

    pub fn build_tts(&self, config: &TtsConfig) -> Result<Arc<dyn SpeechSynthesisBackend>, PipelineError> {
        let constructor = self
            .tts
            .get(&config.provider.to_ascii_lowercase())
            .ok_or_else(|| PipelineError::UnknownBackend {
                kind: "speech synthesis",
                name: config.provider.clone(),
            })?;
        constructor(config)
    }

    pub fn llm_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.llm.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tts_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tts.keys().cloned().collect();
        names.sort();
        names
    }
}

fn build_claude(config: &LlmConfig) -> Result<Arc<dyn LanguageModelBackend>, PipelineError> {
    Ok(Arc::new(ClaudeBackend::new(config)?))
}

fn build_ollama(config: &LlmConfig) -> Result<Arc<dyn LanguageModelBackend>, PipelineError> {
    Ok(Arc::new(OllamaBackend::new(config)?))
}

fn build_elevenlabs(config: &TtsConfig) -> Result<Arc<dyn SpeechSynthesisBackend>, PipelineError> {
    Ok(Arc::new(ElevenLabsBackend::new(config)?))
}

/// Build the shared HTTP client used by every vendor backend.
pub(crate) fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client, PipelineError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PipelineError::Config(format!("failed to create HTTP client: {e}")))
}

/// Turn a non-success response into `RejectedByProvider`, keeping the body
/// for diagnostics.
pub(crate) async fn reject(resp: reqwest::Response) -> BackendError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    BackendError::RejectedByProvider { status, body }
}
