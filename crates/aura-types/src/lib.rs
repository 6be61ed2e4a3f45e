//! Shared types and constants for the Aura voice assistant.
//!
//! This crate holds the plain data passed between the token server, the
//! LiveKit plumbing in `aura-voice`, and the agent pipeline in `aura-agent`.
//! It has no runtime dependencies beyond `serde`.

pub mod voice;

pub use voice::{AudioFrame, ChatMessage, ChatRole, NoiseCancellation};

/// Room joined when a client does not name one.
pub const DEFAULT_ROOM_NAME: &str = "aura-ai-room";

/// Participant identity used when a client does not supply one.
pub const DEFAULT_PARTICIPANT_IDENTITY: &str = "aura-ai-user";

/// Participant display name used when a client does not supply one.
pub const DEFAULT_PARTICIPANT_NAME: &str = "Aura AI User";

/// Identity the voice agent itself joins rooms with.
pub const AGENT_IDENTITY: &str = "aura-ai-agent";

/// Display name the voice agent itself joins rooms with.
pub const AGENT_NAME: &str = "Aura AI";
