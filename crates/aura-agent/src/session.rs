//! The agent session: five capabilities bound to one room.
//!
//! A session is built once per job, started against the job's room, and then
//! driven two ways: explicitly through [`AgentSession::generate_reply`] (the
//! greeting), and implicitly by the turn loop that `start` spawns, which
//! listens to the room and answers the user whenever a turn ends.

use crate::error::AgentError;
use crate::llm::LanguageModel;
use crate::stt::SpeechToText;
use crate::tts::TextToSpeech;
use crate::turn::TurnDetector;
use crate::vad::{VadEvent, VoiceActivityDetector};
use aura_types::{AudioFrame, ChatMessage, NoiseCancellation};
use aura_voice::{ConnectionState, RemoteAudio, RoomHandle};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The conversational identity the session speaks as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    pub instructions: String,
}

impl Agent {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
        }
    }
}

/// Options applied to the audio the agent receives from the room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomInputOptions {
    pub noise_cancellation: NoiseCancellation,
}

/// Collects the five capabilities of a session.
pub struct AgentSessionBuilder {
    stt: Option<Arc<dyn SpeechToText>>,
    llm: Option<Arc<dyn LanguageModel>>,
    tts: Option<Arc<dyn TextToSpeech>>,
    vad: Option<Box<dyn VoiceActivityDetector>>,
    turn_detection: Option<Arc<dyn TurnDetector>>,
    turn_threshold: f32,
    max_endpointing_delay: Duration,
}

impl Default for AgentSessionBuilder {
    fn default() -> Self {
        Self {
            stt: None,
            llm: None,
            tts: None,
            vad: None,
            turn_detection: None,
            turn_threshold: 0.5,
            max_endpointing_delay: Duration::from_secs(6),
        }
    }
}

impl AgentSessionBuilder {
    pub fn stt(mut self, stt: impl SpeechToText + 'static) -> Self {
        self.stt = Some(Arc::new(stt));
        self
    }

    pub fn llm(mut self, llm: impl LanguageModel + 'static) -> Self {
        self.llm = Some(Arc::new(llm));
        self
    }

    pub fn tts(mut self, tts: impl TextToSpeech + 'static) -> Self {
        self.tts = Some(Arc::new(tts));
        self
    }

    pub fn vad(mut self, vad: impl VoiceActivityDetector + 'static) -> Self {
        self.vad = Some(Box::new(vad));
        self
    }

    pub fn turn_detection(mut self, detector: impl TurnDetector + 'static) -> Self {
        self.turn_detection = Some(Arc::new(detector));
        self
    }

    pub fn turn_threshold(mut self, threshold: f32) -> Self {
        self.turn_threshold = threshold;
        self
    }

    /// How long an unfinished user turn may stay silent before the agent
    /// replies anyway.
    pub fn max_endpointing_delay(mut self, delay: Duration) -> Self {
        self.max_endpointing_delay = delay;
        self
    }

    pub fn build(self) -> Result<AgentSession, AgentError> {
        fn missing(name: &str) -> AgentError {
            AgentError::Config(format!("session is missing its {} component", name))
        }

        let inner = SessionInner {
            stt: self.stt.ok_or_else(|| missing("stt"))?,
            llm: self.llm.ok_or_else(|| missing("llm"))?,
            tts: self.tts.ok_or_else(|| missing("tts"))?,
            turn_detection: self.turn_detection.ok_or_else(|| missing("turn detection"))?,
            turn_threshold: self.turn_threshold,
            max_endpointing_delay: self.max_endpointing_delay,
            history: Mutex::new(Vec::new()),
            room: OnceLock::new(),
        };
        let vad = self.vad.ok_or_else(|| missing("vad"))?;

        Ok(AgentSession {
            inner: Arc::new(inner),
            vad: StdMutex::new(Some(vad)),
            turn_loop: StdMutex::new(None),
        })
    }
}

struct SessionInner {
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    turn_detection: Arc<dyn TurnDetector>,
    turn_threshold: f32,
    max_endpointing_delay: Duration,
    history: Mutex<Vec<ChatMessage>>,
    room: OnceLock<Arc<RoomHandle>>,
}

/// What became of one user utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserTurn {
    /// Nothing was transcribed.
    Ignored,
    /// The user seems to have more to say.
    Open,
    Answered,
}

/// A configured voice pipeline for one job.
pub struct AgentSession {
    inner: Arc<SessionInner>,
    vad: StdMutex<Option<Box<dyn VoiceActivityDetector>>>,
    turn_loop: StdMutex<Option<JoinHandle<()>>>,
}

impl AgentSession {
    pub fn builder() -> AgentSessionBuilder {
        AgentSessionBuilder::default()
    }

    /// Attaches the session to `room` and begins listening.
    ///
    /// The room does not need to be connected yet: the turn loop idles until
    /// audio arrives and exits once the room closes.
    pub async fn start(
        &self,
        room: Arc<RoomHandle>,
        agent: Agent,
        options: RoomInputOptions,
    ) -> Result<(), AgentError> {
        self.inner
            .room
            .set(Arc::clone(&room))
            .map_err(|_| AgentError::Session("session already started".to_string()))?;

        let vad = self
            .vad
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .ok_or_else(|| AgentError::Session("voice activity detector unavailable".to_string()))?;

        room.set_noise_cancellation(options.noise_cancellation);
        self.inner
            .history
            .lock()
            .await
            .push(ChatMessage::system(agent.instructions));

        let handle = tokio::spawn(run_turn_loop(
            Arc::clone(&self.inner),
            vad,
            room.subscribe_audio(),
            room.watch_state(),
        ));
        if let Ok(mut guard) = self.turn_loop.lock() {
            *guard = Some(handle);
        }

        info!(
            room = %room.name(),
            noise_cancellation = %options.noise_cancellation,
            "agent session started"
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner.room.get().is_some()
    }

    /// Asks the language model for one reply and speaks it into the room.
    ///
    /// `instructions` steer this reply only; they are not kept in the history.
    pub async fn generate_reply(&self, instructions: Option<&str>) -> Result<String, AgentError> {
        self.inner.generate_reply(instructions).await
    }

    /// Snapshot of the conversation so far.
    pub async fn history(&self) -> Vec<ChatMessage> {
        self.inner.history.lock().await.clone()
    }

    /// Stops the turn loop. The room is left to its owner.
    pub fn close(&self) {
        if let Ok(mut guard) = self.turn_loop.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    /// Resolves once the turn loop has exited.
    pub async fn wait_closed(&self) {
        let handle = self.turn_loop.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl SessionInner {
    fn room(&self) -> Result<&Arc<RoomHandle>, AgentError> {
        self.room
            .get()
            .ok_or_else(|| AgentError::Session("session has not been started".to_string()))
    }

    async fn generate_reply(&self, instructions: Option<&str>) -> Result<String, AgentError> {
        let room = self.room()?;

        let mut messages = self.history.lock().await.clone();
        if let Some(extra) = instructions {
            messages.push(ChatMessage::system(extra));
        }

        let reply = self.llm.generate(&messages).await?;
        self.history
            .lock()
            .await
            .push(ChatMessage::assistant(reply.clone()));

        let audio = self.tts.synthesize(&reply).await?;
        room.publish_audio(&audio).await?;

        debug!(room = %room.name(), chars = reply.len(), "agent replied");
        Ok(reply)
    }

    async fn handle_utterance(
        &self,
        speaker: &str,
        utterance: AudioFrame,
    ) -> Result<UserTurn, AgentError> {
        let text = self.stt.transcribe(&utterance).await?;
        if text.is_empty() {
            debug!(speaker, "empty transcript, ignoring utterance");
            return Ok(UserTurn::Ignored);
        }
        info!(speaker, text = %text, "user said");

        let snapshot = {
            let mut history = self.history.lock().await;
            history.push(ChatMessage::user(text));
            history.clone()
        };

        let probability = self
            .turn_detection
            .end_of_turn_probability(&snapshot)
            .await?;
        if probability < self.turn_threshold {
            debug!(probability, "user turn still open");
            return Ok(UserTurn::Open);
        }

        self.generate_reply(None).await?;
        Ok(UserTurn::Answered)
    }
}

async fn run_turn_loop(
    inner: Arc<SessionInner>,
    mut vad: Box<dyn VoiceActivityDetector>,
    mut audio_rx: broadcast::Receiver<RemoteAudio>,
    mut state_rx: watch::Receiver<ConnectionState>,
) {
    // Set while the user's last turn looked unfinished.
    let mut endpoint_deadline: Option<Instant> = None;

    loop {
        if *state_rx.borrow() == ConnectionState::Closed {
            break;
        }

        let deadline = endpoint_deadline;
        tokio::select! {
            received = audio_rx.recv() => match received {
                Ok(remote) => match vad.push_frame(&remote.frame) {
                    Some(VadEvent::StartOfSpeech) => endpoint_deadline = None,
                    Some(VadEvent::EndOfSpeech { utterance }) => {
                        match inner
                            .handle_utterance(&remote.participant_identity, utterance)
                            .await
                        {
                            Ok(UserTurn::Open) => {
                                endpoint_deadline = Some(Instant::now() + inner.max_endpointing_delay);
                            }
                            Ok(UserTurn::Answered) => endpoint_deadline = None,
                            Ok(UserTurn::Ignored) => {}
                            Err(e) => warn!(error = %e, "dropping user turn"),
                        }
                    }
                    None => {}
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "turn loop lagged behind room audio");
                    vad.reset();
                }
                Err(RecvError::Closed) => break,
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                endpoint_deadline = None;
                debug!("user went quiet mid-turn, replying");
                if let Err(e) = inner.generate_reply(None).await {
                    warn!(error = %e, "dropping delayed reply");
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("turn loop exited");
}
