//! Worker configuration loading from file and environment variables.

use crate::llm::OpenAiConfig;
use crate::stt::DeepgramConfig;
use crate::tts::CartesiaConfig;
use crate::turn::TurnDetectionConfig;
use crate::vad::VadConfig;
use aura_types::NoiseCancellation;
use aura_voice::LiveKitConfig;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_INSTRUCTIONS: &str = "You are Aura AI, a helpful and friendly voice assistant. \
Your purpose is to assist users with their queries in a polite and efficient manner. \
Always respond concisely and clearly.";

pub const DEFAULT_GREETING: &str =
    "Hello! I am Aura AI, your personal voice assistant. How can I help you today?";

/// Top-level worker configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub livekit: LiveKitConfig,

    #[serde(default)]
    pub stt: DeepgramConfig,

    #[serde(default)]
    pub llm: OpenAiConfig,

    #[serde(default)]
    pub tts: CartesiaConfig,

    #[serde(default)]
    pub vad: VadConfig,

    #[serde(default)]
    pub turn_detection: TurnDetectionConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What the agent says and how it listens.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Personality bound to the agent for the whole session.
    #[serde(default = "default_instructions")]
    pub instructions: String,

    /// Instruction for the opening utterance.
    #[serde(default = "default_greeting")]
    pub greeting: String,

    #[serde(default)]
    pub noise_cancellation: NoiseCancellation,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "aura_agent=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_instructions() -> String {
    DEFAULT_INSTRUCTIONS.to_string()
}

fn default_greeting() -> String {
    DEFAULT_GREETING.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instructions: default_instructions(),
            greeting: default_greeting(),
            noise_cancellation: NoiseCancellation::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `LIVEKIT_URL`, `LIVEKIT_API_KEY`, `LIVEKIT_API_SECRET` override `livekit.*`
/// - `DEEPGRAM_API_KEY` overrides `stt.api_key`
/// - `OPENAI_API_KEY` overrides `llm.api_key`
/// - `CARTESIA_API_KEY` overrides `tts.api_key`
/// - `AURA_LOG_LEVEL` overrides `logging.level`
/// - `AURA_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<AgentConfig, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                AgentConfig::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => AgentConfig::default(),
    };

    config.livekit.apply_env_overrides();
    if let Ok(key) = std::env::var("DEEPGRAM_API_KEY") {
        config.stt.api_key = key;
    }
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        config.llm.api_key = key;
    }
    if let Ok(key) = std::env::var("CARTESIA_API_KEY") {
        config.tts.api_key = key;
    }
    if let Ok(level) = std::env::var("AURA_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("AURA_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}
