use crate::config::LiveKitConfig;
use crate::error::VoiceError;
use crate::media::{MediaConnection, MediaOptions, MediaSink, MediaTransport};
use crate::service::TokenService;
use async_trait::async_trait;
use aura_types::{AudioFrame, NoiseCancellation, AGENT_IDENTITY, AGENT_NAME};
use livekit_api::services::room::{CreateRoomOptions, RoomClient};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

/// Default capacity for the per-room remote audio broadcast channel.
const DEFAULT_REMOTE_AUDIO_BROADCAST_CAPACITY: usize = 256;

/// Server-side room operations the agent needs before it can join.
#[async_trait]
pub trait RoomSignaling: Send + Sync + fmt::Debug {
    /// Makes sure the room exists. Creating an existing room is not an error.
    async fn ensure_room(&self, room_name: &str) -> Result<(), VoiceError>;
}

/// [`RoomSignaling`] backed by the LiveKit room service API.
pub struct LiveKitSignaling {
    url: String,
    room_client: RoomClient,
}

impl fmt::Debug for LiveKitSignaling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveKitSignaling").field("url", &self.url).finish()
    }
}

impl LiveKitSignaling {
    pub fn new(config: &LiveKitConfig) -> Self {
        Self {
            url: config.url.clone(),
            room_client: RoomClient::with_api_key(&config.url, &config.api_key, &config.api_secret),
        }
    }
}

#[async_trait]
impl RoomSignaling for LiveKitSignaling {
    async fn ensure_room(&self, room_name: &str) -> Result<(), VoiceError> {
        let room = self
            .room_client
            .create_room(room_name, CreateRoomOptions::default())
            .await
            .map_err(|e| VoiceError::RoomService(e.to_string()))?;
        debug!(room = %room.name, sid = %room.sid, "room ready");
        Ok(())
    }
}

/// Lifecycle of the agent's connection to one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handle created, `connect` not called yet.
    Idle,
    Connected,
    /// Disconnected. A closed handle cannot reconnect.
    Closed,
}

/// Audio received from another participant in the room.
#[derive(Debug, Clone)]
pub struct RemoteAudio {
    pub participant_identity: String,
    pub frame: AudioFrame,
}

/// The agent's view of a single LiveKit room.
///
/// Connection establishment goes through [`RoomSignaling`] and the
/// [`TokenService`], then hands the token to a [`MediaTransport`]. Remote
/// audio reaches subscribers of [`RoomHandle::subscribe_audio`]; the agent
/// speaks through [`RoomHandle::publish_audio`].
pub struct RoomHandle {
    room_name: String,
    tokens: Arc<TokenService>,
    signaling: Arc<dyn RoomSignaling>,
    transport: Arc<dyn MediaTransport>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    token: Mutex<Option<String>>,
    noise_cancellation: Mutex<NoiseCancellation>,
    connection: Mutex<Option<Arc<dyn MediaConnection>>>,
    audio_tx: broadcast::Sender<RemoteAudio>,
    published_samples: AtomicU64,
}

impl fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room_name", &self.room_name)
            .field("state", &self.state())
            .field("published_samples", &self.published_samples())
            .finish()
    }
}

impl RoomHandle {
    pub fn new(
        room_name: impl Into<String>,
        tokens: Arc<TokenService>,
        signaling: Arc<dyn RoomSignaling>,
        transport: Arc<dyn MediaTransport>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (audio_tx, _) = broadcast::channel(DEFAULT_REMOTE_AUDIO_BROADCAST_CAPACITY);
        Self {
            room_name: room_name.into(),
            tokens,
            signaling,
            transport,
            state_tx: Arc::new(state_tx),
            token: Mutex::new(None),
            noise_cancellation: Mutex::new(NoiseCancellation::default()),
            connection: Mutex::new(None),
            audio_tx,
            published_samples: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.room_name
    }

    pub fn url(&self) -> &str {
        self.tokens.get_url()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The agent's own join token, present once connected.
    pub fn token(&self) -> Option<String> {
        self.token.lock().ok().and_then(|guard| guard.clone())
    }

    /// Watches connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn connection(&self) -> Option<Arc<dyn MediaConnection>> {
        self.connection.lock().ok().and_then(|guard| guard.clone())
    }

    /// Establishes the agent's connection to the room.
    pub async fn connect(&self) -> Result<(), VoiceError> {
        match self.state() {
            ConnectionState::Connected => {
                return Err(VoiceError::AlreadyConnected(self.room_name.clone()))
            }
            ConnectionState::Closed => return Err(VoiceError::RoomClosed(self.room_name.clone())),
            ConnectionState::Idle => {}
        }

        info!(room = %self.room_name, url = %self.url(), "agent connecting to LiveKit room");

        self.signaling.ensure_room(&self.room_name).await?;
        let token = self
            .tokens
            .generate_join_token(&self.room_name, AGENT_IDENTITY, AGENT_NAME)?;

        let options = MediaOptions {
            noise_cancellation: self.noise_cancellation(),
        };
        let sink = MediaSink::new(
            self.room_name.clone(),
            self.audio_tx.clone(),
            Arc::clone(&self.state_tx),
        );
        let connection = self
            .transport
            .connect(self.url(), &token, options, sink)
            .await?;

        // A disconnect that raced the handshake wins.
        if self.state() == ConnectionState::Closed {
            connection.close();
            return Err(VoiceError::RoomClosed(self.room_name.clone()));
        }

        if let Ok(mut guard) = self.token.lock() {
            *guard = Some(token);
        }
        if let Ok(mut guard) = self.connection.lock() {
            *guard = Some(connection);
        }
        self.state_tx.send_replace(ConnectionState::Connected);

        info!(
            room = %self.room_name,
            noise_cancellation = %options.noise_cancellation,
            "agent connected"
        );
        Ok(())
    }

    /// Selects the noise cancellation applied to audio the agent receives.
    pub fn set_noise_cancellation(&self, mode: NoiseCancellation) {
        if let Ok(mut guard) = self.noise_cancellation.lock() {
            *guard = mode;
        }
        if let Some(connection) = self.connection() {
            connection.set_noise_cancellation(mode);
        }
    }

    pub fn noise_cancellation(&self) -> NoiseCancellation {
        self.noise_cancellation
            .lock()
            .map(|guard| *guard)
            .unwrap_or_default()
    }

    /// Publishes PCM audio from the agent into the room.
    pub async fn publish_audio(&self, frame: &AudioFrame) -> Result<(), VoiceError> {
        let connection = match self.connection() {
            Some(connection) if self.is_connected() => connection,
            _ => return Err(VoiceError::NotConnected(self.room_name.clone())),
        };

        info!(
            room = %self.room_name,
            samples = frame.samples.len(),
            duration_ms = frame.duration_ms(),
            "agent publishing audio"
        );
        connection.publish_audio(frame).await?;
        self.published_samples
            .fetch_add(frame.samples.len() as u64, Ordering::Relaxed);

        Ok(())
    }

    /// Total samples the agent has published since connecting.
    pub fn published_samples(&self) -> u64 {
        self.published_samples.load(Ordering::Relaxed)
    }

    /// Hands a frame heard from `participant_identity` to every subscriber,
    /// as if the media connection had received it.
    pub fn deliver_remote_audio(
        &self,
        participant_identity: &str,
        frame: AudioFrame,
    ) -> Result<(), VoiceError> {
        if !self.is_connected() {
            return Err(VoiceError::NotConnected(self.room_name.clone()));
        }

        let event = RemoteAudio {
            participant_identity: participant_identity.to_string(),
            frame,
        };

        // No subscriber simply means no session is listening yet.
        let _ = self.audio_tx.send(event);

        Ok(())
    }

    /// Subscribes to audio frames from other participants.
    pub fn subscribe_audio(&self) -> broadcast::Receiver<RemoteAudio> {
        self.audio_tx.subscribe()
    }

    pub fn disconnect(&self) {
        let previous = self.state_tx.send_replace(ConnectionState::Closed);
        let connection = self.connection.lock().ok().and_then(|mut guard| guard.take());
        if let Some(connection) = connection {
            connection.close();
        }
        if previous != ConnectionState::Closed {
            info!(room = %self.room_name, "agent disconnecting from room");
        }
    }
}
