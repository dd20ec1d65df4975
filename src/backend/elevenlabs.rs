//! ElevenLabs streaming text-to-speech backend.
//!
//! The whole response body is collected before returning, so one call
//! yields the complete audio for one unit. Default output is 8 kHz mu-law,
//! the format telephony media streams expect.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use super::{http_client, reject, SpeechSynthesisBackend};
use crate::config::TtsConfig;
use crate::error::{BackendError, PipelineError};

pub struct ElevenLabsBackend {
    url: String,
    api_key: String,
    model_id: String,
    language_code: String,
    client: Client,
}

impl ElevenLabsBackend {
    pub fn new(config: &TtsConfig) -> Result<Self, PipelineError> {
        let api_key = config.resolve_api_key()?;
        let voice_id = config.resolve_voice_id()?;
        let url = format!(
            "{}/{voice_id}/stream?output_format={}&optimize_streaming_latency={}",
            config.api_url.trim_end_matches('/'),
            config.output_format,
            config.optimize_streaming_latency,
        );

        Ok(Self {
            url,
            api_key,
            model_id: config.model_id.clone(),
            language_code: config.language_code.clone(),
            client: http_client(config.timeout())?,
        })
    }
}

#[async_trait]
impl SpeechSynthesisBackend for ElevenLabsBackend {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, BackendError> {
        let body = json!({
            "model_id": self.model_id,
            "text": text,
            "language_code": self.language_code,
        });

        let resp = self
            .client
            .post(&self.url)
            .header("xi-api-key", &self.api_key)
            .header("accept", "audio/wav")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!("ElevenLabs request failed: {e}");
                BackendError::from_reqwest(e)
            })?;

        if !resp.status().is_success() {
            let err = reject(resp).await;
            warn!("ElevenLabs returned error: {err}");
            return Err(err);
        }

        let audio = resp.bytes().await.map_err(BackendError::from_reqwest)?;
        debug!("ElevenLabs produced {} bytes for {} chars", audio.len(), text.len());
        Ok(audio.to_vec())
    }
}
