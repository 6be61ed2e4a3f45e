use crate::config::LiveKitConfig;
use crate::error::VoiceError;
use aura_types::{DEFAULT_PARTICIPANT_IDENTITY, DEFAULT_PARTICIPANT_NAME, DEFAULT_ROOM_NAME};
use livekit_api::access_token::{AccessToken, VideoGrants};
use std::time::Duration;

/// Who wants to join which room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room_name: String,
    pub identity: String,
    pub name: String,
}

impl Default for JoinRequest {
    fn default() -> Self {
        Self {
            room_name: DEFAULT_ROOM_NAME.to_string(),
            identity: DEFAULT_PARTICIPANT_IDENTITY.to_string(),
            name: DEFAULT_PARTICIPANT_NAME.to_string(),
        }
    }
}

impl JoinRequest {
    /// Fills in the default room, identity and name for each `None`.
    ///
    /// Empty strings are kept as given.
    pub fn with_defaults(
        room_name: Option<String>,
        identity: Option<String>,
        name: Option<String>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            room_name: room_name.unwrap_or(defaults.room_name),
            identity: identity.unwrap_or(defaults.identity),
            name: name.unwrap_or(defaults.name),
        }
    }
}

/// Issues signed LiveKit access tokens from a single API key/secret pair.
#[derive(Debug, Clone)]
pub struct TokenService {
    config: LiveKitConfig,
}

impl TokenService {
    pub fn new(config: LiveKitConfig) -> Self {
        Self { config }
    }

    pub fn has_credentials(&self) -> bool {
        self.config.has_credentials()
    }

    pub fn get_url(&self) -> &str {
        &self.config.url
    }

    pub fn config(&self) -> &LiveKitConfig {
        &self.config
    }

    /// Signs a token that lets `request.identity` join exactly `request.room_name`.
    ///
    /// Fails with [`VoiceError::MissingCredentials`] before touching the signer
    /// when either half of the key pair is absent.
    pub fn issue(&self, request: &JoinRequest) -> Result<String, VoiceError> {
        self.generate_join_token(&request.room_name, &request.identity, &request.name)
    }

    pub fn generate_join_token(
        &self,
        room_name: &str,
        participant_identity: &str,
        participant_name: &str,
    ) -> Result<String, VoiceError> {
        if !self.config.has_credentials() {
            return Err(VoiceError::MissingCredentials);
        }

        let token = AccessToken::with_api_key(&self.config.api_key, &self.config.api_secret)
            .with_identity(participant_identity)
            .with_name(participant_name)
            .with_grants(VideoGrants {
                room_join: true,
                room: room_name.to_string(),
                ..Default::default()
            })
            .with_ttl(Duration::from_secs(self.config.token_ttl_seconds));

        token.to_jwt().map_err(VoiceError::LiveKit)
    }
}
