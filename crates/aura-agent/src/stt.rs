use crate::error::AgentError;
use async_trait::async_trait;
use aura_types::AudioFrame;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum audio input size for STT (10 MiB). Prevents OOM from oversized payloads.
const MAX_STT_INPUT_BYTES: usize = 10 * 1024 * 1024;

pub const DEEPGRAM_API_URL: &str = "https://api.deepgram.com";

/// Turns an utterance into text.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &AudioFrame) -> Result<String, AgentError>;
}

fn default_model() -> String {
    "nova-3".to_string()
}

fn default_language() -> String {
    "multi".to_string()
}

fn default_base_url() -> String {
    DEEPGRAM_API_URL.to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DeepgramConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// `multi` enables Deepgram's multilingual code-switching.
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for DeepgramConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            language: default_language(),
            base_url: default_base_url(),
        }
    }
}

impl fmt::Debug for DeepgramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeepgramConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("language", &self.language)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ListenResponse {
    results: ListenResults,
}

#[derive(Debug, Deserialize)]
struct ListenResults {
    channels: Vec<ListenChannel>,
}

#[derive(Debug, Deserialize)]
struct ListenChannel {
    alternatives: Vec<ListenAlternative>,
}

#[derive(Debug, Deserialize)]
struct ListenAlternative {
    transcript: String,
}

/// Deepgram pre-recorded transcription over REST.
#[derive(Debug, Clone)]
pub struct DeepgramStt {
    config: DeepgramConfig,
    client: reqwest::Client,
}

impl DeepgramStt {
    pub fn new(config: DeepgramConfig) -> Result<Self, AgentError> {
        if config.api_key.is_empty() {
            return Err(AgentError::Config(
                "DEEPGRAM_API_KEY is not set".to_string(),
            ));
        }
        if config.model.is_empty() {
            return Err(AgentError::Config("stt.model must not be empty".to_string()));
        }
        let client = crate::build_http_client()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &DeepgramConfig {
        &self.config
    }
}

#[async_trait]
impl SpeechToText for DeepgramStt {
    async fn transcribe(&self, audio: &AudioFrame) -> Result<String, AgentError> {
        if audio.is_empty() {
            return Ok(String::new());
        }

        let body = audio.to_le_bytes();
        if body.len() > MAX_STT_INPUT_BYTES {
            return Err(AgentError::Stt(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                body.len(),
                MAX_STT_INPUT_BYTES
            )));
        }

        let url = format!("{}/v1/listen", self.config.base_url.trim_end_matches('/'));
        let sample_rate = audio.sample_rate.to_string();
        let channels = audio.channels.to_string();

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.config.api_key))
            .header("Content-Type", "application/octet-stream")
            .query(&[
                ("model", self.config.model.as_str()),
                ("language", self.config.language.as_str()),
                ("encoding", "linear16"),
                ("sample_rate", sample_rate.as_str()),
                ("channels", channels.as_str()),
                ("punctuate", "true"),
            ])
            .body(body)
            .send()
            .await
            .map_err(|e| AgentError::Stt(format!("Deepgram request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::Stt(format!(
                "Deepgram returned {}: {}",
                status, detail
            )));
        }

        let parsed: ListenResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Stt(format!("Invalid Deepgram response: {}", e)))?;

        let transcript = parsed
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|channel| channel.alternatives.into_iter().next())
            .map(|alt| alt.transcript.trim().to_string())
            .unwrap_or_default();

        Ok(transcript)
    }
}
