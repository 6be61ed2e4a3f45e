use serde::{Deserialize, Serialize};
use std::fmt;

/// LiveKit server used when nothing is configured (a local `livekit-server --dev`).
pub const DEFAULT_LIVEKIT_URL: &str = "http://localhost:7880";

/// Lifetime of issued tokens. Matches the LiveKit SDK default of six hours.
pub const DEFAULT_TOKEN_TTL_SECONDS: u64 = 6 * 60 * 60;

fn default_url() -> String {
    DEFAULT_LIVEKIT_URL.to_string()
}

fn default_token_ttl_seconds() -> u64 {
    DEFAULT_TOKEN_TTL_SECONDS
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LiveKitConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing)]
    pub api_secret: String,
    /// JWT token TTL in seconds for LiveKit join tokens. Default: 21600 (6 hours).
    #[serde(default = "default_token_ttl_seconds")]
    pub token_ttl_seconds: u64,
}

impl Default for LiveKitConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            api_key: String::new(),
            api_secret: String::new(),
            token_ttl_seconds: default_token_ttl_seconds(),
        }
    }
}

impl fmt::Debug for LiveKitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveKitConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("token_ttl_seconds", &self.token_ttl_seconds)
            .finish()
    }
}

impl LiveKitConfig {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            token_ttl_seconds: default_token_ttl_seconds(),
        }
    }

    /// True when both the API key and the API secret are non-empty.
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    /// Applies `LIVEKIT_URL`, `LIVEKIT_API_KEY` and `LIVEKIT_API_SECRET`
    /// from the process environment on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("LIVEKIT_URL") {
            if !url.trim().is_empty() {
                self.url = url;
            }
        }
        if let Ok(key) = std::env::var("LIVEKIT_API_KEY") {
            self.api_key = key;
        }
        if let Ok(secret) = std::env::var("LIVEKIT_API_SECRET") {
            self.api_secret = secret;
        }
    }

    /// Logs a warning for each missing credential. Returns whether both are present.
    pub fn warn_if_incomplete(&self) -> bool {
        if self.api_key.is_empty() {
            tracing::warn!("LIVEKIT_API_KEY is not set; token issuance will fail until it is configured");
        }
        if self.api_secret.is_empty() {
            tracing::warn!("LIVEKIT_API_SECRET is not set; token issuance will fail until it is configured");
        }
        self.has_credentials()
    }
}
