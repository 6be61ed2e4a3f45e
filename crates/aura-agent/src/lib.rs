//! The Aura AI voice agent worker.
//!
//! Each job attaches a fixed pipeline to one LiveKit room: Deepgram
//! speech-to-text, an OpenAI language model, Cartesia text-to-speech, Silero
//! voice activity detection, and LiveKit's multilingual turn detector. Every
//! capability sits behind its own trait so providers can be swapped without
//! touching the session.

pub mod assistant;
pub mod config;
pub mod error;
pub mod job;
pub mod llm;
pub mod models;
pub mod session;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod vad;
pub mod worker;

pub use assistant::{build_session, download_files, entrypoint, run_job};
pub use config::{load_config, AgentConfig};
pub use error::AgentError;
pub use job::{JobContext, JobRequest};
pub use llm::{LanguageModel, OpenAiConfig, OpenAiLlm};
pub use session::{Agent, AgentSession, AgentSessionBuilder, RoomInputOptions};
pub use stt::{DeepgramConfig, DeepgramStt, SpeechToText};
pub use tts::{CartesiaConfig, CartesiaTts, TextToSpeech};
pub use turn::{
    load_turn_detector, MultilingualTurnDetector, PunctuationTurnDetector, TurnBackend,
    TurnDetectionConfig, TurnDetector,
};
pub use vad::{
    load_vad, EnergyVad, SileroModel, SileroVad, SpeechModel, VadBackend, VadConfig, VadEvent,
    VoiceActivityDetector,
};
pub use worker::{Entrypoint, JobOutcome, Worker, WorkerOptions};

use std::time::Duration;

/// Timeout applied to every provider request.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn build_http_client() -> Result<reqwest::Client, AgentError> {
    reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {}", e)))
}
