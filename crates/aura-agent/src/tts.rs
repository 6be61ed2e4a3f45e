use crate::error::AgentError;
use async_trait::async_trait;
use aura_types::AudioFrame;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

pub const CARTESIA_API_URL: &str = "https://api.cartesia.ai";

/// API version sent with every Cartesia request.
pub const CARTESIA_API_VERSION: &str = "2024-06-10";

/// Speaks text.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Returns mono PCM audio for `text`.
    async fn synthesize(&self, text: &str) -> Result<AudioFrame, AgentError>;
}

fn default_model() -> String {
    "sonic-2".to_string()
}

fn default_voice() -> String {
    "f786b574-daa5-4673-aa0c-cbe3e8534c02".to_string()
}

fn default_sample_rate() -> u32 {
    24000
}

fn default_base_url() -> String {
    CARTESIA_API_URL.to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CartesiaConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Cartesia voice ID.
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for CartesiaConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            voice: default_voice(),
            sample_rate: default_sample_rate(),
            language: None,
            base_url: default_base_url(),
        }
    }
}

impl fmt::Debug for CartesiaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CartesiaConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("sample_rate", &self.sample_rate)
            .field("language", &self.language)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Cartesia `/tts/bytes` synthesis returning raw little-endian PCM.
#[derive(Debug, Clone)]
pub struct CartesiaTts {
    config: CartesiaConfig,
    client: reqwest::Client,
}

impl CartesiaTts {
    pub fn new(config: CartesiaConfig) -> Result<Self, AgentError> {
        if config.api_key.is_empty() {
            return Err(AgentError::Config(
                "CARTESIA_API_KEY is not set".to_string(),
            ));
        }
        if config.voice.is_empty() {
            return Err(AgentError::Config("tts.voice must not be empty".to_string()));
        }
        if !(8000..=48000).contains(&config.sample_rate) {
            return Err(AgentError::Config(
                "tts.sample_rate must be between 8000 and 48000".to_string(),
            ));
        }
        let client = crate::build_http_client()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &CartesiaConfig {
        &self.config
    }
}

#[async_trait]
impl TextToSpeech for CartesiaTts {
    async fn synthesize(&self, text: &str) -> Result<AudioFrame, AgentError> {
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(AgentError::Tts(format!(
                "text exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_TTS_INPUT_BYTES
            )));
        }
        if text.trim().is_empty() {
            return Ok(AudioFrame::new(Vec::new(), self.config.sample_rate, 1));
        }

        let url = format!("{}/tts/bytes", self.config.base_url.trim_end_matches('/'));
        let mut body = json!({
            "model_id": self.config.model,
            "transcript": text,
            "voice": { "mode": "id", "id": self.config.voice },
            "output_format": {
                "container": "raw",
                "encoding": "pcm_s16le",
                "sample_rate": self.config.sample_rate,
            },
        });
        if let Some(language) = &self.config.language {
            body["language"] = json!(language);
        }

        let response = self
            .client
            .post(&url)
            .header("X-API-Key", &self.config.api_key)
            .header("Cartesia-Version", CARTESIA_API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Tts(format!("Cartesia request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::Tts(format!(
                "Cartesia returned {}: {}",
                status, detail
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::Tts(format!("Failed to read Cartesia audio: {}", e)))?;

        Ok(AudioFrame::from_le_bytes(&bytes, self.config.sample_rate, 1))
    }
}
