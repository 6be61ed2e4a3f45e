use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("LiveKit API error: {0}")]
    LiveKit(#[from] livekit_api::access_token::AccessTokenError),

    #[error("LiveKit API key or secret is not configured")]
    MissingCredentials,

    #[error("Room service error: {0}")]
    RoomService(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Not connected to room '{0}'")]
    NotConnected(String),

    #[error("Already connected to room '{0}'")]
    AlreadyConnected(String),

    #[error("Room '{0}' has been closed")]
    RoomClosed(String),
}
