//! Error type for the agent pipeline.

use aura_voice::VoiceError;
use thiserror::Error;

/// Errors raised while configuring or running an agent job.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Voice(#[from] VoiceError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Session error: {0}")]
    Session(String),
}
