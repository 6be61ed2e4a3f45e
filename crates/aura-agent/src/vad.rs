//! Voice activity detection.
//!
//! A detector consumes the room's audio frame by frame and reports when an
//! utterance begins and ends. The end event carries the buffered utterance so
//! the session can hand it straight to speech-to-text.
//!
//! Two detectors share one segmenter: [`SileroVad`] scores speech with the
//! Silero ONNX model, [`EnergyVad`] gates on signal level and needs no model.

use crate::error::AgentError;
use crate::models::{self, model_error};
use aura_types::AudioFrame;
use ort::session::Session;
use ort::value::Value;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Speech boundary reported by a detector.
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    StartOfSpeech,
    EndOfSpeech { utterance: AudioFrame },
}

/// Segments a stream of audio into utterances.
pub trait VoiceActivityDetector: Send {
    /// Feeds one frame. Returns an event when a boundary is crossed.
    fn push_frame(&mut self, frame: &AudioFrame) -> Option<VadEvent>;

    /// True while an utterance is in progress.
    fn is_speaking(&self) -> bool;

    /// Drops any partial utterance.
    fn reset(&mut self);
}

impl VoiceActivityDetector for Box<dyn VoiceActivityDetector> {
    fn push_frame(&mut self, frame: &AudioFrame) -> Option<VadEvent> {
        (**self).push_frame(frame)
    }

    fn is_speaking(&self) -> bool {
        (**self).is_speaking()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Which detector a session uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadBackend {
    #[default]
    Silero,
    Energy,
}

pub const SILERO_MODEL_URL: &str =
    "https://github.com/snakers4/silero-vad/raw/master/src/silero_vad/data/silero_vad.onnx";
const SILERO_MODEL_FILE: &str = "silero_vad.onnx";

fn default_activation_threshold() -> f32 {
    0.5
}

fn default_energy_threshold() -> f32 {
    0.02
}

fn default_min_speech_duration_ms() -> u64 {
    50
}

fn default_min_silence_duration_ms() -> u64 {
    550
}

fn default_max_utterance_ms() -> u64 {
    30_000
}

fn default_model_url() -> String {
    SILERO_MODEL_URL.to_string()
}

pub(crate) fn default_cache_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_num_threads() -> Option<usize> {
    Some(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    #[serde(default)]
    pub backend: VadBackend,
    /// Speech probability (0.0 to 1.0) at which the model reports speech.
    #[serde(default = "default_activation_threshold")]
    pub activation_threshold: f32,
    /// RMS level (0.0 to 1.0) above which the energy detector counts speech.
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: f32,
    /// Speech must last this long before an utterance starts.
    #[serde(default = "default_min_speech_duration_ms")]
    pub min_speech_duration_ms: u64,
    /// Silence must last this long before an utterance ends.
    #[serde(default = "default_min_silence_duration_ms")]
    pub min_silence_duration_ms: u64,
    /// An utterance is cut off and handed on once it reaches this length.
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,
    /// Local Silero model. Downloaded from `model_url` when unset.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_model_url")]
    pub model_url: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_num_threads")]
    pub num_threads: Option<usize>,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            backend: VadBackend::default(),
            activation_threshold: default_activation_threshold(),
            energy_threshold: default_energy_threshold(),
            min_speech_duration_ms: default_min_speech_duration_ms(),
            min_silence_duration_ms: default_min_silence_duration_ms(),
            max_utterance_ms: default_max_utterance_ms(),
            model_path: None,
            model_url: default_model_url(),
            cache_dir: default_cache_dir(),
            num_threads: default_num_threads(),
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        fn unit(name: &str, value: f32) -> Result<(), AgentError> {
            if value > 0.0 && value < 1.0 {
                Ok(())
            } else {
                Err(AgentError::Config(format!(
                    "vad.{} must be between 0.0 and 1.0 (exclusive)",
                    name
                )))
            }
        }
        unit("activation_threshold", self.activation_threshold)?;
        unit("energy_threshold", self.energy_threshold)?;
        if self.min_silence_duration_ms == 0 {
            return Err(AgentError::Config(
                "vad.min_silence_duration_ms must be positive".to_string(),
            ));
        }
        if self.max_utterance_ms <= self.min_speech_duration_ms {
            return Err(AgentError::Config(
                "vad.max_utterance_ms must exceed vad.min_speech_duration_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads the detector selected by `config.backend`.
pub async fn load_vad(config: &VadConfig) -> Result<Box<dyn VoiceActivityDetector>, AgentError> {
    match config.backend {
        VadBackend::Silero => Ok(Box::new(SileroVad::load(config.clone()).await?)),
        VadBackend::Energy => Ok(Box::new(EnergyVad::load(config.clone())?)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    Silence,
    /// Speech seen, not yet long enough to count.
    PotentialSpeech,
    Speech,
    /// Silence inside an utterance, not yet long enough to end it.
    PotentialSilence,
}

/// Turns per-frame speech decisions into utterances.
#[derive(Debug)]
struct Segmenter {
    min_speech_ms: u64,
    min_silence_ms: u64,
    max_utterance_ms: u64,
    state: SegmentState,
    /// Duration of the current run of speech or silence frames.
    run_ms: u64,
    pending: Vec<AudioFrame>,
    pending_ms: u64,
}

impl Segmenter {
    fn new(config: &VadConfig) -> Self {
        Self {
            min_speech_ms: config.min_speech_duration_ms,
            min_silence_ms: config.min_silence_duration_ms,
            max_utterance_ms: config.max_utterance_ms,
            state: SegmentState::Silence,
            run_ms: 0,
            pending: Vec::new(),
            pending_ms: 0,
        }
    }

    fn buffer(&mut self, frame: &AudioFrame) {
        self.pending_ms += frame.duration_ms();
        self.pending.push(frame.clone());
    }

    fn finish(&mut self) -> VadEvent {
        let utterance = AudioFrame::concat(&self.pending);
        self.reset();
        VadEvent::EndOfSpeech { utterance }
    }

    fn push(&mut self, frame: &AudioFrame, voiced: bool) -> Option<VadEvent> {
        let frame_ms = frame.duration_ms();

        let event = match (self.state, voiced) {
            (SegmentState::Silence, false) => None,
            (SegmentState::Silence, true) | (SegmentState::PotentialSpeech, true) => {
                self.buffer(frame);
                self.run_ms = if self.state == SegmentState::Silence {
                    frame_ms
                } else {
                    self.run_ms + frame_ms
                };
                if self.run_ms >= self.min_speech_ms {
                    self.state = SegmentState::Speech;
                    Some(VadEvent::StartOfSpeech)
                } else {
                    self.state = SegmentState::PotentialSpeech;
                    None
                }
            }
            (SegmentState::PotentialSpeech, false) => {
                // False start.
                self.reset();
                None
            }
            (SegmentState::Speech, true) => {
                self.buffer(frame);
                None
            }
            (SegmentState::Speech, false) | (SegmentState::PotentialSilence, false) => {
                self.buffer(frame);
                self.run_ms = if self.state == SegmentState::Speech {
                    frame_ms
                } else {
                    self.run_ms + frame_ms
                };
                if self.run_ms >= self.min_silence_ms {
                    return Some(self.finish());
                }
                self.state = SegmentState::PotentialSilence;
                None
            }
            (SegmentState::PotentialSilence, true) => {
                self.buffer(frame);
                self.state = SegmentState::Speech;
                None
            }
        };

        if event.is_none() && self.is_speaking() && self.pending_ms >= self.max_utterance_ms {
            debug!(duration_ms = self.pending_ms, "utterance reached its length limit");
            return Some(self.finish());
        }
        event
    }

    fn is_speaking(&self) -> bool {
        matches!(self.state, SegmentState::Speech | SegmentState::PotentialSilence)
    }

    fn reset(&mut self) {
        self.state = SegmentState::Silence;
        self.run_ms = 0;
        self.pending.clear();
        self.pending_ms = 0;
    }
}

/// Level-gated detector with speech and silence hysteresis.
#[derive(Debug)]
pub struct EnergyVad {
    config: VadConfig,
    segmenter: Segmenter,
}

impl EnergyVad {
    /// Validates `config` and returns a ready detector.
    pub fn load(config: VadConfig) -> Result<Self, AgentError> {
        config.validate()?;
        Ok(Self {
            segmenter: Segmenter::new(&config),
            config,
        })
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn push_frame(&mut self, frame: &AudioFrame) -> Option<VadEvent> {
        let voiced = frame.rms() >= self.config.energy_threshold;
        self.segmenter.push(frame, voiced)
    }

    fn is_speaking(&self) -> bool {
        self.segmenter.is_speaking()
    }

    fn reset(&mut self) {
        self.segmenter.reset();
    }
}

/// Scores fixed-size windows of mono audio for speech.
pub trait SpeechModel: Send {
    /// Samples per window at `sample_rate`, or `None` if the rate is unsupported.
    fn window_size(&self, sample_rate: u32) -> Option<usize>;

    /// Speech probability for one window of samples in `-1.0..=1.0`.
    fn predict(&mut self, window: &[f32], sample_rate: u32) -> Result<f32, AgentError>;

    /// Forgets any recurrent state.
    fn reset(&mut self);
}

/// Silero VAD v5 running on ONNX Runtime.
pub struct SileroModel {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
    /// Recurrent state, shape `[2, 1, 128]`.
    state: Vec<f32>,
    /// Tail of the previous window, prepended to the next one.
    context: Vec<f32>,
    sample_rate: u32,
}

const SILERO_STATE_LEN: usize = 2 * 128;

impl SileroModel {
    /// Resolves the model file, downloading it on first use.
    pub async fn fetch(config: &VadConfig) -> Result<PathBuf, AgentError> {
        models::ensure_file(
            config.model_path.as_deref(),
            &config.cache_dir.join("vad"),
            SILERO_MODEL_FILE,
            &config.model_url,
        )
        .await
    }

    /// Resolves the model file and opens a session.
    pub async fn load(config: &VadConfig) -> Result<Self, AgentError> {
        let path = Self::fetch(config).await?;
        let session = models::load_session(path, config.num_threads).await?;

        let input_names = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names = session.outputs.iter().map(|o| o.name.clone()).collect();
        Ok(Self {
            session,
            input_names,
            output_names,
            state: vec![0.0; SILERO_STATE_LEN],
            context: Vec::new(),
            sample_rate: 0,
        })
    }

    fn context_size(sample_rate: u32) -> usize {
        if sample_rate == 8000 {
            32
        } else {
            64
        }
    }
}

impl SpeechModel for SileroModel {
    fn window_size(&self, sample_rate: u32) -> Option<usize> {
        match sample_rate {
            16000 => Some(512),
            8000 => Some(256),
            _ => None,
        }
    }

    fn predict(&mut self, window: &[f32], sample_rate: u32) -> Result<f32, AgentError> {
        let context_size = Self::context_size(sample_rate);
        if self.sample_rate != sample_rate {
            self.reset();
            self.sample_rate = sample_rate;
        }
        if self.context.len() != context_size {
            self.context = vec![0.0; context_size];
        }

        let mut input = Vec::with_capacity(context_size + window.len());
        input.extend_from_slice(&self.context);
        input.extend_from_slice(window);
        let input_len = input.len();

        let mut inputs: Vec<(String, Value)> = Vec::with_capacity(self.input_names.len());
        for name in &self.input_names {
            let value: Value = match name.as_str() {
                "input" => Value::from_array(([1usize, input_len], input.clone()))
                    .map_err(|e| model_error("silero input", e))?
                    .into(),
                "state" => Value::from_array(([2usize, 1, 128], self.state.clone()))
                    .map_err(|e| model_error("silero state", e))?
                    .into(),
                "sr" => Value::from_array(([1usize], vec![i64::from(sample_rate)]))
                    .map_err(|e| model_error("silero sample rate", e))?
                    .into(),
                other => {
                    return Err(AgentError::Model(format!(
                        "unexpected silero input '{}'",
                        other
                    )))
                }
            };
            inputs.push((name.clone(), value));
        }

        let outputs = self
            .session
            .run(inputs)
            .map_err(|e| model_error("silero inference", e))?;

        let probability_name = self.output_names.first().map(String::as_str).unwrap_or("output");
        let (_, probability) = outputs
            .get(probability_name)
            .ok_or_else(|| AgentError::Model("silero returned no probability".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| model_error("silero probability", e))?;
        let probability = probability.first().copied().unwrap_or(0.0);

        if let Some(state_name) = self.output_names.get(1) {
            if let Some(value) = outputs.get(state_name.as_str()) {
                let (_, state) = value
                    .try_extract_tensor::<f32>()
                    .map_err(|e| model_error("silero state", e))?;
                if state.len() == SILERO_STATE_LEN {
                    self.state.copy_from_slice(state);
                }
            }
        }

        let tail = window.len().saturating_sub(context_size);
        self.context.clear();
        self.context.extend_from_slice(&window[tail..]);
        self.context.resize(context_size, 0.0);

        Ok(probability)
    }

    fn reset(&mut self) {
        self.state.fill(0.0);
        self.context.fill(0.0);
    }
}

/// Speech probability drops this far below the activation threshold before
/// an utterance counts as silent again.
const DEACTIVATION_MARGIN: f32 = 0.15;

/// Model-scored detector. Frames are buffered into model windows; the most
/// recent probability decides each frame.
pub struct SileroVad {
    config: VadConfig,
    model: Box<dyn SpeechModel>,
    segmenter: Segmenter,
    window: Vec<f32>,
    window_rate: u32,
    probability: f32,
    warned_rate: Option<u32>,
}

impl SileroVad {
    pub async fn load(config: VadConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let model = SileroModel::load(&config).await?;
        Self::with_model(model, config)
    }

    /// Builds a detector around any [`SpeechModel`].
    pub fn with_model(model: impl SpeechModel + 'static, config: VadConfig) -> Result<Self, AgentError> {
        config.validate()?;
        Ok(Self {
            segmenter: Segmenter::new(&config),
            config,
            model: Box::new(model),
            window: Vec::new(),
            window_rate: 0,
            probability: 0.0,
            warned_rate: None,
        })
    }

    /// Latest speech probability reported by the model.
    pub fn probability(&self) -> f32 {
        self.probability
    }

    fn score(&mut self, frame: &AudioFrame) -> f32 {
        let Some(window_size) = self.model.window_size(frame.sample_rate) else {
            if self.warned_rate != Some(frame.sample_rate) {
                warn!(sample_rate = frame.sample_rate, "speech model cannot score this sample rate");
                self.warned_rate = Some(frame.sample_rate);
            }
            return 0.0;
        };
        if frame.sample_rate != self.window_rate {
            self.window.clear();
            self.model.reset();
            self.window_rate = frame.sample_rate;
        }

        let channels = usize::from(frame.channels.max(1));
        self.window.extend(frame.samples.chunks(channels).map(|c| {
            c.iter().map(|&s| f32::from(s)).sum::<f32>() / (channels as f32 * 32768.0)
        }));

        while self.window.len() >= window_size {
            let chunk: Vec<f32> = self.window.drain(..window_size).collect();
            self.probability = match self.model.predict(&chunk, frame.sample_rate) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "speech model failed on a window");
                    0.0
                }
            };
        }
        self.probability
    }
}

impl VoiceActivityDetector for SileroVad {
    fn push_frame(&mut self, frame: &AudioFrame) -> Option<VadEvent> {
        let probability = self.score(frame);
        let threshold = if self.segmenter.is_speaking() {
            (self.config.activation_threshold - DEACTIVATION_MARGIN).max(0.01)
        } else {
            self.config.activation_threshold
        };
        self.segmenter.push(frame, probability >= threshold)
    }

    fn is_speaking(&self) -> bool {
        self.segmenter.is_speaking()
    }

    fn reset(&mut self) {
        self.segmenter.reset();
        self.window.clear();
        self.model.reset();
        self.probability = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 10 ms of 16 kHz mono audio at a constant level.
    fn frame(level: i16) -> AudioFrame {
        AudioFrame::new(vec![level; 160], 16000, 1)
    }

    fn config() -> VadConfig {
        VadConfig {
            backend: VadBackend::Energy,
            energy_threshold: 0.05,
            min_speech_duration_ms: 30,
            min_silence_duration_ms: 50,
            ..VadConfig::default()
        }
    }

    fn vad() -> EnergyVad {
        EnergyVad::load(config()).unwrap()
    }

    #[test]
    fn silence_produces_no_events() {
        let mut vad = vad();
        for _ in 0..100 {
            assert_eq!(vad.push_frame(&frame(0)), None);
        }
        assert!(!vad.is_speaking());
    }

    #[test]
    fn utterance_is_segmented() {
        let mut vad = vad();
        let loud = frame(8000);

        assert_eq!(vad.push_frame(&loud), None);
        assert_eq!(vad.push_frame(&loud), None);
        assert_eq!(vad.push_frame(&loud), Some(VadEvent::StartOfSpeech));
        assert!(vad.is_speaking());
        for _ in 0..7 {
            assert_eq!(vad.push_frame(&loud), None);
        }

        let mut ended = None;
        for _ in 0..5 {
            if let Some(event) = vad.push_frame(&frame(0)) {
                ended = Some(event);
            }
        }
        match ended {
            Some(VadEvent::EndOfSpeech { utterance }) => {
                // 10 voiced frames plus 5 trailing silent frames.
                assert_eq!(utterance.samples.len(), 15 * 160);
                assert_eq!(utterance.sample_rate, 16000);
            }
            other => panic!("expected end of speech, got {:?}", other),
        }
        assert!(!vad.is_speaking());
    }

    #[test]
    fn short_blip_is_a_false_start() {
        let mut vad = vad();
        assert_eq!(vad.push_frame(&frame(8000)), None);
        assert_eq!(vad.push_frame(&frame(0)), None);
        for _ in 0..10 {
            assert_eq!(vad.push_frame(&frame(0)), None);
        }
    }

    #[test]
    fn brief_pause_does_not_end_utterance() {
        let mut vad = vad();
        for _ in 0..5 {
            vad.push_frame(&frame(8000));
        }
        for _ in 0..3 {
            assert_eq!(vad.push_frame(&frame(0)), None);
        }
        assert!(vad.is_speaking());
        vad.push_frame(&frame(8000));
        assert!(vad.is_speaking());
    }

    #[test]
    fn endless_speech_is_cut_at_the_length_limit() {
        let mut vad = EnergyVad::load(VadConfig {
            max_utterance_ms: 1_000,
            ..config()
        })
        .unwrap();

        // Ten minutes of uninterrupted speech.
        let mut utterances = Vec::new();
        for _ in 0..60_000 {
            if let Some(VadEvent::EndOfSpeech { utterance }) = vad.push_frame(&frame(8000)) {
                utterances.push(utterance);
            }
        }

        assert_eq!(utterances.len(), 600);
        for utterance in &utterances {
            assert_eq!(utterance.duration_ms(), 1_000);
        }
    }

    #[test]
    fn default_length_limit_keeps_utterances_small() {
        let config = VadConfig::default();
        // 16-bit mono at the highest published rate.
        let bytes = config.max_utterance_ms * 48 * 2;
        assert!(bytes < 10 * 1024 * 1024);
    }

    #[test]
    fn invalid_config_fails_to_load() {
        let config = VadConfig {
            energy_threshold: 1.5,
            ..VadConfig::default()
        };
        assert!(matches!(EnergyVad::load(config), Err(AgentError::Config(_))));

        let config = VadConfig {
            max_utterance_ms: 10,
            ..VadConfig::default()
        };
        assert!(matches!(EnergyVad::load(config), Err(AgentError::Config(_))));
        assert!(EnergyVad::load(VadConfig::default()).is_ok());
    }

    #[test]
    fn model_backend_is_the_default() {
        assert_eq!(VadConfig::default().backend, VadBackend::Silero);
        let parsed: VadConfig = toml::from_str("backend = \"energy\"").unwrap();
        assert_eq!(parsed.backend, VadBackend::Energy);
    }

    /// Scores a window as speech when its mean magnitude is high.
    struct LevelModel {
        windows: usize,
        resets: usize,
    }

    impl SpeechModel for LevelModel {
        fn window_size(&self, sample_rate: u32) -> Option<usize> {
            (sample_rate == 16000).then_some(512)
        }

        fn predict(&mut self, window: &[f32], _sample_rate: u32) -> Result<f32, AgentError> {
            self.windows += 1;
            let level = window.iter().map(|s| s.abs()).sum::<f32>() / window.len() as f32;
            Ok(if level > 0.1 { 0.95 } else { 0.02 })
        }

        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    fn silero() -> SileroVad {
        SileroVad::with_model(
            LevelModel {
                windows: 0,
                resets: 0,
            },
            VadConfig {
                min_speech_duration_ms: 30,
                min_silence_duration_ms: 100,
                ..VadConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn model_scores_whole_windows() {
        let mut vad = silero();
        // 512-sample windows: the third 10 ms frame completes no window,
        // the fourth does.
        for _ in 0..3 {
            assert_eq!(vad.push_frame(&frame(8000)), None);
        }
        assert_eq!(vad.probability(), 0.0);
        vad.push_frame(&frame(8000));
        assert!(vad.probability() > 0.9);
    }

    #[test]
    fn model_segments_an_utterance() {
        let mut vad = silero();
        let mut events = Vec::new();
        for _ in 0..40 {
            events.extend(vad.push_frame(&frame(8000)));
        }
        assert_eq!(events, vec![VadEvent::StartOfSpeech]);

        for _ in 0..30 {
            events.extend(vad.push_frame(&frame(0)));
        }
        assert!(matches!(events.last(), Some(VadEvent::EndOfSpeech { .. })));
        assert!(!vad.is_speaking());
    }

    #[test]
    fn unsupported_rate_is_treated_as_silence() {
        let mut vad = silero();
        for _ in 0..50 {
            assert_eq!(
                vad.push_frame(&AudioFrame::new(vec![8000; 441], 44100, 1)),
                None
            );
        }
        assert!(!vad.is_speaking());
    }
}
