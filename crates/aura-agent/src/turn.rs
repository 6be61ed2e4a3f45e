//! End-of-turn detection.
//!
//! [`MultilingualTurnDetector`] runs LiveKit's multilingual end-of-utterance
//! model over the recent conversation. [`PunctuationTurnDetector`] scores
//! transcript cues alone and needs no model.

use crate::error::AgentError;
use crate::models::{self, model_error};
use async_trait::async_trait;
use aura_types::{ChatMessage, ChatRole};
use ort::session::Session;
use ort::value::Value;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokenizers::Tokenizer;
use tracing::debug;

/// Scores whether the user has finished speaking.
#[async_trait]
pub trait TurnDetector: Send + Sync {
    /// Probability in `0.0..=1.0` that the user's latest turn is complete.
    async fn end_of_turn_probability(&self, history: &[ChatMessage]) -> Result<f32, AgentError>;
}

#[async_trait]
impl TurnDetector for Arc<dyn TurnDetector> {
    async fn end_of_turn_probability(&self, history: &[ChatMessage]) -> Result<f32, AgentError> {
        (**self).end_of_turn_probability(history).await
    }
}

/// Which detector a session uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnBackend {
    #[default]
    Model,
    Heuristic,
}

const TURN_MODEL_BASE_URL: &str = "https://huggingface.co/livekit/turn-detector/resolve/v0.4.1-intl";
const TURN_MODEL_FILE: &str = "model_q8.onnx";
const TURN_TOKENIZER_FILE: &str = "tokenizer.json";

fn default_threshold() -> f32 {
    0.5
}

fn default_max_endpointing_delay_ms() -> u64 {
    6_000
}

fn default_model_url() -> String {
    format!("{}/onnx/{}", TURN_MODEL_BASE_URL, TURN_MODEL_FILE)
}

fn default_tokenizer_url() -> String {
    format!("{}/{}", TURN_MODEL_BASE_URL, TURN_TOKENIZER_FILE)
}

fn default_num_threads() -> Option<usize> {
    Some(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetectionConfig {
    #[serde(default)]
    pub backend: TurnBackend,
    /// Replies are generated once the end-of-turn probability reaches this value.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Longest the agent waits after an unfinished turn before replying anyway.
    #[serde(default = "default_max_endpointing_delay_ms")]
    pub max_endpointing_delay_ms: u64,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
    #[serde(default = "default_model_url")]
    pub model_url: String,
    #[serde(default = "default_tokenizer_url")]
    pub tokenizer_url: String,
    #[serde(default = "crate::vad::default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_num_threads")]
    pub num_threads: Option<usize>,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            backend: TurnBackend::default(),
            threshold: default_threshold(),
            max_endpointing_delay_ms: default_max_endpointing_delay_ms(),
            model_path: None,
            tokenizer_path: None,
            model_url: default_model_url(),
            tokenizer_url: default_tokenizer_url(),
            cache_dir: crate::vad::default_cache_dir(),
            num_threads: default_num_threads(),
        }
    }
}

impl TurnDetectionConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(AgentError::Config(
                "turn_detection.threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.max_endpointing_delay_ms == 0 {
            return Err(AgentError::Config(
                "turn_detection.max_endpointing_delay_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_endpointing_delay(&self) -> Duration {
        Duration::from_millis(self.max_endpointing_delay_ms)
    }
}

/// Loads the detector selected by `config.backend`.
pub async fn load_turn_detector(
    config: &TurnDetectionConfig,
) -> Result<Arc<dyn TurnDetector>, AgentError> {
    match config.backend {
        TurnBackend::Model => Ok(Arc::new(MultilingualTurnDetector::load(config).await?)),
        TurnBackend::Heuristic => Ok(Arc::new(PunctuationTurnDetector::new())),
    }
}

/// Conversation turns the model sees.
const MAX_HISTORY_TURNS: usize = 6;
/// Tokens the model sees, counted from the end.
const MAX_HISTORY_TOKENS: usize = 128;

/// Lowercases and strips punctuation other than apostrophes and hyphens,
/// matching how the model's training transcripts were cleaned.
fn normalize(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|&c| c.is_alphanumeric() || c.is_whitespace() || c == '\'' || c == '-')
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Renders the recent conversation in the model's chat format, leaving the
/// final user message open. `None` when the user has not spoken last.
pub fn format_chat(history: &[ChatMessage]) -> Option<String> {
    let mut turns: Vec<(ChatRole, String)> = Vec::new();
    for msg in history {
        if msg.role == ChatRole::System {
            continue;
        }
        let content = normalize(&msg.content);
        if content.is_empty() {
            continue;
        }
        match turns.last_mut() {
            Some((role, text)) if *role == msg.role => {
                text.push(' ');
                text.push_str(&content);
            }
            _ => turns.push((msg.role, content)),
        }
    }

    if turns.last().map(|(role, _)| *role) != Some(ChatRole::User) {
        return None;
    }

    let start = turns.len().saturating_sub(MAX_HISTORY_TURNS);
    let mut text = String::new();
    for (role, content) in &turns[start..] {
        let role = if *role == ChatRole::User { "user" } else { "assistant" };
        text.push_str("<|im_start|>");
        text.push_str(role);
        text.push('\n');
        text.push_str(content);
        text.push_str("<|im_end|>\n");
    }

    // The model predicts whether the last message closes here.
    let open = text.rfind("<|im_end|>")?;
    text.truncate(open);
    Some(text)
}

/// LiveKit's multilingual end-of-utterance model on ONNX Runtime.
pub struct MultilingualTurnDetector {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<Tokenizer>,
}

impl MultilingualTurnDetector {
    /// Resolves the model and tokenizer files, downloading them on first use.
    pub async fn fetch(config: &TurnDetectionConfig) -> Result<(PathBuf, PathBuf), AgentError> {
        let cache_dir = config.cache_dir.join("turn-detector");
        let model_path = models::ensure_file(
            config.model_path.as_deref(),
            &cache_dir,
            TURN_MODEL_FILE,
            &config.model_url,
        )
        .await?;
        let tokenizer_path = models::ensure_file(
            config.tokenizer_path.as_deref(),
            &cache_dir,
            TURN_TOKENIZER_FILE,
            &config.tokenizer_url,
        )
        .await?;
        Ok((model_path, tokenizer_path))
    }

    /// Resolves the model files and opens a session.
    pub async fn load(config: &TurnDetectionConfig) -> Result<Self, AgentError> {
        let (model_path, tokenizer_path) = Self::fetch(config).await?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| model_error("failed to load turn tokenizer", e))?;
        let session = models::load_session(model_path, config.num_threads).await?;

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
        })
    }

    fn token_ids(&self, text: &str) -> Result<Vec<i64>, AgentError> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| model_error("turn tokenizer", e))?;
        let ids = encoding.get_ids();
        let start = ids.len().saturating_sub(MAX_HISTORY_TOKENS);
        Ok(ids[start..].iter().map(|&id| i64::from(id)).collect())
    }
}

fn run_turn_model(session: &Mutex<Session>, ids: Vec<i64>) -> Result<f32, AgentError> {
    let mut session = session
        .lock()
        .map_err(|_| AgentError::Model("turn model session poisoned".to_string()))?;
    let output_name = session
        .outputs
        .first()
        .map(|o| o.name.clone())
        .ok_or_else(|| AgentError::Model("turn model has no outputs".to_string()))?;

    let len = ids.len();
    let input: Value = Value::from_array(([1usize, len], ids))
        .map_err(|e| model_error("turn model input", e))?
        .into();
    let outputs = session
        .run(vec![("input_ids".to_string(), input)])
        .map_err(|e| model_error("turn model inference", e))?;

    let (_, probabilities) = outputs
        .get(output_name.as_str())
        .ok_or_else(|| AgentError::Model("turn model returned no probability".to_string()))?
        .try_extract_tensor::<f32>()
        .map_err(|e| model_error("turn model probability", e))?;
    Ok(probabilities.last().copied().unwrap_or(0.0))
}

#[async_trait]
impl TurnDetector for MultilingualTurnDetector {
    async fn end_of_turn_probability(&self, history: &[ChatMessage]) -> Result<f32, AgentError> {
        let Some(text) = format_chat(history) else {
            return Ok(0.0);
        };
        let ids = self.token_ids(&text)?;
        if ids.is_empty() {
            return Ok(0.0);
        }

        let session = Arc::clone(&self.session);
        let probability = tokio::task::spawn_blocking(move || run_turn_model(&session, ids))
            .await
            .map_err(|e| model_error("turn model task failed", e))??;

        debug!(probability, "end of turn scored");
        Ok(probability)
    }
}

const COMPLETE: f32 = 0.9;
const UNPUNCTUATED: f32 = 0.6;
const TRAILING_OFF: f32 = 0.1;

/// Sentence-final punctuation across the scripts the STT returns.
const TERMINAL_MARKS: &[char] = &['.', '!', '?', '…', '。', '！', '？', '؟', '।'];

/// Words that almost never end a finished utterance.
const CONTINUATION_WORDS: &[&str] = &[
    // English
    "and", "but", "or", "so", "because", "um", "uh", "like", "the", "a", "an", "to", "of",
    "with", "if", "then", "my", "your",
    // Spanish
    "y", "pero", "o", "porque", "el", "la", "de", "que",
    // French
    "et", "mais", "ou", "parce", "le", "les", "du",
    // German
    "und", "aber", "oder", "weil", "der", "die", "das",
];

/// Language-agnostic end-of-utterance scoring over the transcript text.
///
/// Looks only at the most recent user message: sentence-final punctuation
/// means the turn is done, a trailing conjunction, article, or filler word
/// means the user is still going.
#[derive(Debug, Clone, Default)]
pub struct PunctuationTurnDetector;

impl PunctuationTurnDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn score(text: &str) -> f32 {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return 0.0;
        }
        if trimmed.ends_with(TERMINAL_MARKS) {
            return COMPLETE;
        }
        let trailing = trimmed
            .trim_end_matches(|c: char| c == ',' || c == ';' || c == ':' || c == '-')
            .rsplit(char::is_whitespace)
            .next()
            .unwrap_or_default()
            .to_lowercase();
        if trimmed.ends_with([',', ';', ':', '-'])
            || CONTINUATION_WORDS.contains(&trailing.as_str())
        {
            return TRAILING_OFF;
        }
        UNPUNCTUATED
    }
}

#[async_trait]
impl TurnDetector for PunctuationTurnDetector {
    async fn end_of_turn_probability(&self, history: &[ChatMessage]) -> Result<f32, AgentError> {
        let latest = history
            .iter()
            .rev()
            .find(|msg| msg.role == ChatRole::User)
            .map(|msg| msg.content.as_str())
            .unwrap_or_default();
        Ok(Self::score(latest))
    }
}
