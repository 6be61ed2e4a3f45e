//! Audio and conversation types shared by the agent pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A block of interleaved signed 16-bit PCM audio.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Decodes little-endian s16 bytes. A trailing odd byte is dropped.
    pub fn from_le_bytes(bytes: &[u8], sample_rate: u32, channels: u16) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(samples, sample_rate, channels)
    }

    /// Encodes the samples as little-endian s16 bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        let per_second = u64::from(self.sample_rate) * u64::from(self.channels.max(1));
        if per_second == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / per_second
    }

    /// Root-mean-square level normalized to `0.0..=1.0`.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = f64::from(s) / f64::from(i16::MAX);
                v * v
            })
            .sum();
        (sum / self.samples.len() as f64).sqrt() as f32
    }

    /// Concatenates frames that share a format. The format of the first
    /// frame wins.
    pub fn concat(frames: &[AudioFrame]) -> AudioFrame {
        let Some(first) = frames.first() else {
            return AudioFrame::default();
        };
        let samples = frames
            .iter()
            .flat_map(|f| f.samples.iter().copied())
            .collect();
        AudioFrame::new(samples, first.sample_rate, first.channels)
    }
}

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One entry of the conversation history handed to the language model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Noise cancellation applied to room input by LiveKit Cloud.
///
/// The filtering itself runs in the hosted media pipeline; the agent only
/// selects the mode when it attaches to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseCancellation {
    /// No filtering.
    Disabled,
    /// Standard noise cancellation.
    Nc,
    /// Background voice cancellation: removes other speakers as well as noise.
    #[default]
    Bvc,
}

impl fmt::Display for NoiseCancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disabled => "disabled",
            Self::Nc => "nc",
            Self::Bvc => "bvc",
        };
        f.write_str(label)
    }
}

impl FromStr for NoiseCancellation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(Self::Disabled),
            "nc" => Ok(Self::Nc),
            "bvc" => Ok(Self::Bvc),
            other => Err(format!("unknown noise cancellation mode: {}", other)),
        }
    }
}
