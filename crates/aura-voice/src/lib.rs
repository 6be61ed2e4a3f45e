//! LiveKit plumbing for the Aura voice assistant.
//!
//! Mints signed room-access credentials for browser clients and for the
//! agent itself, tracks the agent's connection to a room, and moves PCM
//! audio between the room's WebRTC media and the agent pipeline.

pub mod config;
pub mod error;
pub mod media;
pub mod room;
pub mod service;

pub use config::{LiveKitConfig, DEFAULT_LIVEKIT_URL, DEFAULT_TOKEN_TTL_SECONDS};
pub use error::VoiceError;
pub use media::{
    LiveKitTransport, MediaConnection, MediaOptions, MediaSink, MediaTransport,
    ProcessingSettings, INPUT_SAMPLE_RATE,
};
pub use room::{
    ConnectionState, LiveKitSignaling, RemoteAudio, RoomHandle, RoomSignaling,
};
pub use service::{JoinRequest, TokenService};
