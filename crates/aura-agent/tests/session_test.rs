mod common;

use async_trait::async_trait;
use aura_agent::{
    Agent, AgentError, AgentSession, AgentSessionBuilder, EnergyVad, LanguageModel,
    PunctuationTurnDetector, RoomInputOptions, SpeechToText, TextToSpeech, TurnDetector,
    VadBackend, VadConfig,
};
use aura_types::{AudioFrame, ChatMessage, ChatRole, NoiseCancellation};
use aura_voice::{MediaOptions, RoomHandle, VoiceError};
use common::{room, room_with, FakeTransport, RecordingSignaling};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct FixedStt(&'static str);

#[async_trait]
impl SpeechToText for FixedStt {
    async fn transcribe(&self, _audio: &AudioFrame) -> Result<String, AgentError> {
        Ok(self.0.to_string())
    }
}

#[derive(Clone, Default)]
struct RecordingLlm {
    calls: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

#[async_trait]
impl LanguageModel for RecordingLlm {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, AgentError> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(messages.to_vec());
        Ok(format!("reply {}", calls.len()))
    }
}

struct SilentTts;

#[async_trait]
impl TextToSpeech for SilentTts {
    async fn synthesize(&self, _text: &str) -> Result<AudioFrame, AgentError> {
        Ok(AudioFrame::new(vec![0; 480], 24000, 1))
    }
}

struct FixedTurn(f32);

#[async_trait]
impl TurnDetector for FixedTurn {
    async fn end_of_turn_probability(&self, _history: &[ChatMessage]) -> Result<f32, AgentError> {
        Ok(self.0)
    }
}

fn fast_vad() -> EnergyVad {
    EnergyVad::load(VadConfig {
        backend: VadBackend::Energy,
        energy_threshold: 0.05,
        min_speech_duration_ms: 20,
        min_silence_duration_ms: 30,
        ..VadConfig::default()
    })
    .unwrap()
}

fn builder(llm: RecordingLlm) -> AgentSessionBuilder {
    AgentSession::builder()
        .stt(FixedStt("What can you do?"))
        .llm(llm)
        .tts(SilentTts)
        .vad(fast_vad())
}

fn session(llm: RecordingLlm, end_of_turn: f32) -> AgentSession {
    builder(llm)
        .turn_detection(FixedTurn(end_of_turn))
        .build()
        .expect("all components present")
}

/// Feeds 100 ms of speech without ending the utterance.
fn keep_talking(room: &RoomHandle) {
    for _ in 0..10 {
        room.deliver_remote_audio("alice", AudioFrame::new(vec![8000; 160], 16000, 1))
            .unwrap();
    }
}

/// Feeds 50 ms of silence, enough to end an utterance.
fn pause(room: &RoomHandle) {
    for _ in 0..5 {
        room.deliver_remote_audio("alice", AudioFrame::new(vec![0; 160], 16000, 1))
            .unwrap();
    }
}

/// Feeds 100 ms of speech followed by 50 ms of silence.
fn speak(room: &RoomHandle) {
    keep_talking(room);
    pause(room);
}

async fn started(session: &AgentSession, name: &str) -> Arc<RoomHandle> {
    let room = room(name);
    session
        .start(Arc::clone(&room), Agent::new("You are Aura AI."), RoomInputOptions::default())
        .await
        .unwrap();
    room.connect().await.unwrap();
    room
}

async fn wait_for_history(session: &AgentSession, len: usize) -> Vec<ChatMessage> {
    for _ in 0..200 {
        let history = session.history().await;
        if history.len() >= len {
            return history;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("history never reached {} messages", len);
}

#[test]
fn builder_requires_every_component() {
    let result = AgentSession::builder()
        .stt(FixedStt("x"))
        .llm(RecordingLlm::default())
        .tts(SilentTts)
        .turn_detection(FixedTurn(1.0))
        .build();
    match result {
        Err(AgentError::Config(msg)) => assert!(msg.contains("vad"), "got: {}", msg),
        _ => panic!("expected missing vad"),
    }
}

#[tokio::test]
async fn greeting_is_generated_and_published() {
    let llm = RecordingLlm::default();
    let session = session(llm.clone(), 1.0);
    let room = room("greet-room");

    session
        .start(
            Arc::clone(&room),
            Agent::new("You are Aura AI."),
            RoomInputOptions {
                noise_cancellation: NoiseCancellation::Bvc,
            },
        )
        .await
        .unwrap();
    assert_eq!(room.noise_cancellation(), NoiseCancellation::Bvc);

    room.connect().await.unwrap();
    let reply = session
        .generate_reply(Some("Say hello to the user."))
        .await
        .unwrap();
    assert_eq!(reply, "reply 1");
    assert_eq!(room.published_samples(), 480);

    let calls = llm.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0][0], ChatMessage::system("You are Aura AI."));
    assert_eq!(calls[0][1], ChatMessage::system("Say hello to the user."));

    // One-off instructions are not kept in the history.
    let history = session.history().await;
    assert_eq!(
        history,
        vec![
            ChatMessage::system("You are Aura AI."),
            ChatMessage::assistant("reply 1"),
        ]
    );
}

#[tokio::test]
async fn greeting_before_connect_fails() {
    let session = session(RecordingLlm::default(), 1.0);
    let room = room("early-room");
    session
        .start(Arc::clone(&room), Agent::new("hi"), RoomInputOptions::default())
        .await
        .unwrap();

    let result = session.generate_reply(Some("greet")).await;
    assert!(matches!(
        result,
        Err(AgentError::Voice(VoiceError::NotConnected(_)))
    ));
    assert_eq!(room.published_samples(), 0);
}

#[tokio::test]
async fn reply_requires_start() {
    let session = session(RecordingLlm::default(), 1.0);
    let result = session.generate_reply(None).await;
    assert!(matches!(result, Err(AgentError::Session(_))));
}

#[tokio::test]
async fn session_starts_once() {
    let session = session(RecordingLlm::default(), 1.0);
    let room = room("twice-room");
    session
        .start(Arc::clone(&room), Agent::new("hi"), RoomInputOptions::default())
        .await
        .unwrap();
    assert!(session.is_started());

    let second = session
        .start(room, Agent::new("hi"), RoomInputOptions::default())
        .await;
    assert!(matches!(second, Err(AgentError::Session(_))));
}

#[tokio::test]
async fn finished_user_turn_gets_a_reply() {
    let llm = RecordingLlm::default();
    let session = session(llm.clone(), 0.9);
    let room = room("turn-room");
    session
        .start(Arc::clone(&room), Agent::new("You are Aura AI."), RoomInputOptions::default())
        .await
        .unwrap();
    room.connect().await.unwrap();

    speak(&room);

    let history = wait_for_history(&session, 3).await;
    assert_eq!(history[1], ChatMessage::user("What can you do?"));
    assert_eq!(history[2].role, ChatRole::Assistant);
    assert_eq!(room.published_samples(), 480);
}

#[tokio::test]
async fn open_user_turn_waits() {
    let llm = RecordingLlm::default();
    let session = session(llm.clone(), 0.1);
    let room = started(&session, "open-turn-room").await;

    speak(&room);

    let history = wait_for_history(&session, 2).await;
    assert_eq!(history[1], ChatMessage::user("What can you do?"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.history().await.len(), 2);
    assert!(llm.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unfinished_turn_is_answered_after_max_delay() {
    let llm = RecordingLlm::default();
    let session = AgentSession::builder()
        .stt(FixedStt("I want to book a flight and"))
        .llm(llm.clone())
        .tts(SilentTts)
        .vad(fast_vad())
        .turn_detection(PunctuationTurnDetector::new())
        .max_endpointing_delay(Duration::from_millis(200))
        .build()
        .unwrap();
    let room = started(&session, "trailing-room").await;

    speak(&room);
    wait_for_history(&session, 2).await;
    assert!(llm.calls.lock().unwrap().is_empty());

    // Silence from here on; the agent must not wait forever.
    let history = wait_for_history(&session, 3).await;
    assert_eq!(history[1], ChatMessage::user("I want to book a flight and"));
    assert_eq!(history[2], ChatMessage::assistant("reply 1"));
    assert_eq!(llm.calls.lock().unwrap().len(), 1);
    assert_eq!(room.published_samples(), 480);
}

#[tokio::test]
async fn resumed_speech_postpones_the_delayed_reply() {
    let llm = RecordingLlm::default();
    let session = builder(llm.clone())
        .turn_detection(FixedTurn(0.1))
        .max_endpointing_delay(Duration::from_millis(300))
        .build()
        .unwrap();
    let room = started(&session, "resumed-room").await;

    speak(&room);
    wait_for_history(&session, 2).await;

    // The user starts again before the delay runs out and keeps going.
    keep_talking(&room);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(llm.calls.lock().unwrap().is_empty());

    pause(&room);
    let history = wait_for_history(&session, 4).await;
    assert_eq!(history[2], ChatMessage::user("What can you do?"));
    assert_eq!(history[3].role, ChatRole::Assistant);
    assert_eq!(llm.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn noise_cancellation_reaches_the_media_connection() {
    let transport = FakeTransport::default();
    let room = room_with(
        "nc-room",
        Arc::new(RecordingSignaling::default()),
        Arc::new(transport.clone()),
    );
    let session = session(RecordingLlm::default(), 1.0);
    session
        .start(
            Arc::clone(&room),
            Agent::new("hi"),
            RoomInputOptions {
                noise_cancellation: NoiseCancellation::Nc,
            },
        )
        .await
        .unwrap();
    room.connect().await.unwrap();

    assert_eq!(
        transport.options(),
        vec![MediaOptions {
            noise_cancellation: NoiseCancellation::Nc
        }]
    );
    assert!(room.is_connected());
}

#[tokio::test]
async fn disconnect_stops_turn_loop() {
    let session = session(RecordingLlm::default(), 1.0);
    let room = room("closing-room");
    session
        .start(Arc::clone(&room), Agent::new("hi"), RoomInputOptions::default())
        .await
        .unwrap();
    room.connect().await.unwrap();

    room.disconnect();
    tokio::time::timeout(Duration::from_secs(2), session.wait_closed())
        .await
        .expect("turn loop should exit after disconnect");
}
