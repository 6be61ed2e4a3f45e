#![allow(dead_code)]

use async_trait::async_trait;
use aura_types::{AudioFrame, NoiseCancellation};
use aura_voice::{
    LiveKitConfig, MediaConnection, MediaOptions, MediaSink, MediaTransport, RoomHandle,
    RoomSignaling, TokenService, VoiceError,
};
use std::sync::{Arc, Mutex};

pub fn livekit() -> LiveKitConfig {
    LiveKitConfig::new("http://localhost:7880", "devkey", "secret")
}

#[derive(Debug, Default)]
pub struct RecordingSignaling {
    pub rooms: Mutex<Vec<String>>,
}

#[async_trait]
impl RoomSignaling for RecordingSignaling {
    async fn ensure_room(&self, room_name: &str) -> Result<(), VoiceError> {
        self.rooms.lock().unwrap().push(room_name.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MediaLog {
    pub options: Vec<MediaOptions>,
    pub published: Vec<usize>,
    pub closed: usize,
}

/// Media layer that records what it is asked to do instead of joining a
/// real room.
#[derive(Debug, Default, Clone)]
pub struct FakeTransport {
    pub log: Arc<Mutex<MediaLog>>,
}

impl FakeTransport {
    pub fn options(&self) -> Vec<MediaOptions> {
        self.log.lock().unwrap().options.clone()
    }

    pub fn published(&self) -> Vec<usize> {
        self.log.lock().unwrap().published.clone()
    }

    pub fn closed(&self) -> usize {
        self.log.lock().unwrap().closed
    }
}

struct FakeConnection {
    log: Arc<Mutex<MediaLog>>,
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn connect(
        &self,
        _url: &str,
        _token: &str,
        options: MediaOptions,
        _sink: MediaSink,
    ) -> Result<Arc<dyn MediaConnection>, VoiceError> {
        self.log.lock().unwrap().options.push(options);
        Ok(Arc::new(FakeConnection {
            log: Arc::clone(&self.log),
        }))
    }
}

#[async_trait]
impl MediaConnection for FakeConnection {
    async fn publish_audio(&self, frame: &AudioFrame) -> Result<(), VoiceError> {
        self.log.lock().unwrap().published.push(frame.samples.len());
        Ok(())
    }

    fn set_noise_cancellation(&self, _mode: NoiseCancellation) {}

    fn close(&self) {
        self.log.lock().unwrap().closed += 1;
    }
}

pub fn room_with(
    name: &str,
    signaling: Arc<dyn RoomSignaling>,
    transport: Arc<dyn MediaTransport>,
) -> Arc<RoomHandle> {
    let tokens = Arc::new(TokenService::new(livekit()));
    Arc::new(RoomHandle::new(name, tokens, signaling, transport))
}

pub fn room(name: &str) -> Arc<RoomHandle> {
    room_with(
        name,
        Arc::new(RecordingSignaling::default()),
        Arc::new(FakeTransport::default()),
    )
}
