//! Configuration management for call-speaker-rs.
//!
//! Loads config from YAML files in standard locations. Every section has
//! defaults; secrets are resolved when a backend is constructed so that a
//! missing key fails fast instead of on the first call.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::PipelineError;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly phone assistant. Keep your responses brief \
and conversational, and don't ask more than one question at a time. Add a '•' symbol after each \
sentence, including short sentences within a longer response, to indicate natural pauses for \
text-to-speech conversion.";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Registry name of the language-model backend ("claude", "ollama").
    pub provider: String,
    pub model: String,
    pub api_url: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub api_version: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub system_prompt: String,
    /// Sent as the first user turn when the log opens with the assistant.
    pub opening_turn: String,
    pub closing_turn: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "claude".into(),
            model: "claude-3-haiku-20240307".into(),
            api_url: "https://api.anthropic.com/v1/messages".into(),
            api_key: None,
            api_key_env: "CLAUDE_API_KEY".into(),
            api_version: "2023-06-01".into(),
            max_tokens: 1024,
            timeout_secs: 30,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            opening_turn: "Hello.".into(),
            closing_turn: "Please continue.".into(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn resolve_api_key(&self) -> Result<String, PipelineError> {
        resolve_secret(self.api_key.as_deref(), &self.api_key_env, "llm.api_key")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Registry name of the speech-synthesis backend ("elevenlabs").
    pub provider: String,
    pub api_url: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub voice_id: Option<String>,
    pub voice_id_env: String,
    pub model_id: String,
    pub language_code: String,
    pub output_format: String,
    pub optimize_streaming_latency: u8,
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: "elevenlabs".into(),
            api_url: "https://api.elevenlabs.io/v1/text-to-speech".into(),
            api_key: None,
            api_key_env: "XI_API_KEY".into(),
            voice_id: None,
            voice_id_env: "XI_VOICE_ID".into(),
            model_id: "eleven_monolingual_v1".into(),
            language_code: "en".into(),
            output_format: "ulaw_8000".into(),
            optimize_streaming_latency: 3,
            timeout_secs: 10,
        }
    }
}

impl TtsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn resolve_api_key(&self) -> Result<String, PipelineError> {
        resolve_secret(self.api_key.as_deref(), &self.api_key_env, "tts.api_key")
    }

    pub fn resolve_voice_id(&self) -> Result<String, PipelineError> {
        resolve_secret(self.voice_id.as_deref(), &self.voice_id_env, "tts.voice_id")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on concurrent synthesis calls.
    pub max_in_flight: usize,
    pub pause_marker: char,
    /// Capacity of the ordered output event channel.
    pub output_buffer: usize,
    /// Capacity of the synthesis event channel feeding the reorder buffer.
    pub event_buffer: usize,
    pub summary_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            pause_marker: '•',
            output_buffer: 32,
            event_buffer: 64,
            summary_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// Directory for JSONL records. Empty means ~/.call-speaker-history.
    pub dir: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: String::new(),
        }
    }
}

impl HistoryConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        if self.dir.is_empty() {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".call-speaker-history")
        } else {
            PathBuf::from(&self.dir)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub pipeline: PipelineConfig,
    pub history: HistoryConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/call-speaker/config.yaml
    /// 3. /etc/call-speaker/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/call-speaker/config.yaml")),
                Some(PathBuf::from("/etc/call-speaker/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, PipelineError> {
        let config: Self =
            serde_yml::from_str(contents).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.pipeline.max_in_flight == 0 {
            return Err(PipelineError::Config(
                "pipeline.max_in_flight must be at least 1".into(),
            ));
        }
        if self.pipeline.output_buffer == 0 || self.pipeline.event_buffer == 0 {
            return Err(PipelineError::Config(
                "pipeline channel capacities must be at least 1".into(),
            ));
        }
        if self.llm.timeout_secs == 0 || self.tts.timeout_secs == 0 {
            return Err(PipelineError::Config("backend timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Inline value wins; otherwise read the named environment variable.
fn resolve_secret(inline: Option<&str>, env_var: &str, option: &str) -> Result<String, PipelineError> {
    if let Some(value) = inline.filter(|v| !v.trim().is_empty()) {
        return Ok(value.to_string());
    }
    match std::env::var(env_var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(PipelineError::Config(format!(
            "{option} is not set (configure it inline or via ${env_var})"
        ))),
    }
}
