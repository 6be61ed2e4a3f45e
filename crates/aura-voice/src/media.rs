//! Media transport: the WebRTC side of a room.
//!
//! [`RoomHandle`](crate::RoomHandle) owns credentials and lifecycle; a
//! [`MediaTransport`] turns a join token into a live [`MediaConnection`] that
//! publishes the agent's audio and reports what the other participants say
//! through a [`MediaSink`].

use crate::error::VoiceError;
use crate::room::{ConnectionState, RemoteAudio};
use async_trait::async_trait;
use aura_types::{AudioFrame, NoiseCancellation};
use futures_util::StreamExt;
use livekit::options::TrackPublishOptions;
use livekit::prelude::*;
use livekit::webrtc::audio_frame::AudioFrame as RtcAudioFrame;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_source::{AudioSourceOptions, RtcAudioSource};
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use livekit::webrtc::native::apm::AudioProcessingModule;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Remote audio is resampled to this rate before it reaches the agent.
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Buffered audio in the agent's outgoing source.
const OUTPUT_QUEUE_MS: u32 = 200;

const AGENT_TRACK_NAME: &str = "aura-agent-audio";

/// Settings applied when a connection is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaOptions {
    pub noise_cancellation: NoiseCancellation,
}

/// Audio processing stages enabled for a noise cancellation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingSettings {
    pub echo_cancellation: bool,
    pub gain_control: bool,
    pub high_pass_filter: bool,
    pub noise_suppression: bool,
}

impl ProcessingSettings {
    /// `None` when the mode leaves remote audio untouched.
    pub fn for_mode(mode: NoiseCancellation) -> Option<Self> {
        match mode {
            NoiseCancellation::Disabled => None,
            NoiseCancellation::Nc => Some(Self {
                echo_cancellation: false,
                gain_control: false,
                high_pass_filter: true,
                noise_suppression: true,
            }),
            // Background voices are attenuated by levelling the dominant
            // speaker on top of plain suppression.
            NoiseCancellation::Bvc => Some(Self {
                echo_cancellation: false,
                gain_control: true,
                high_pass_filter: true,
                noise_suppression: true,
            }),
        }
    }
}

/// Where a connection reports remote audio and disconnects.
#[derive(Clone)]
pub struct MediaSink {
    room_name: String,
    audio_tx: broadcast::Sender<RemoteAudio>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
}

impl fmt::Debug for MediaSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSink")
            .field("room_name", &self.room_name)
            .finish()
    }
}

impl MediaSink {
    pub(crate) fn new(
        room_name: String,
        audio_tx: broadcast::Sender<RemoteAudio>,
        state_tx: Arc<watch::Sender<ConnectionState>>,
    ) -> Self {
        Self {
            room_name,
            audio_tx,
            state_tx,
        }
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    /// Hands a frame heard from `participant_identity` to the room's listeners.
    pub fn deliver(&self, participant_identity: &str, frame: AudioFrame) {
        if *self.state_tx.borrow() == ConnectionState::Closed {
            return;
        }
        // No subscriber simply means no session is listening yet.
        let _ = self.audio_tx.send(RemoteAudio {
            participant_identity: participant_identity.to_string(),
            frame,
        });
    }

    /// Marks the room closed after the server or network ended the session.
    pub fn disconnected(&self) {
        let previous = self.state_tx.send_replace(ConnectionState::Closed);
        if previous != ConnectionState::Closed {
            info!(room = %self.room_name, "media connection lost");
        }
    }
}

/// Opens media connections to rooms.
#[async_trait]
pub trait MediaTransport: Send + Sync + fmt::Debug {
    async fn connect(
        &self,
        url: &str,
        token: &str,
        options: MediaOptions,
        sink: MediaSink,
    ) -> Result<Arc<dyn MediaConnection>, VoiceError>;
}

/// A live media session in one room.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Plays `frame` into the room as the agent's voice.
    async fn publish_audio(&self, frame: &AudioFrame) -> Result<(), VoiceError>;

    /// Changes the processing applied to remote audio from now on.
    fn set_noise_cancellation(&self, mode: NoiseCancellation);

    /// Leaves the room. Must not block.
    fn close(&self);
}

/// [`MediaTransport`] backed by the LiveKit Rust SDK.
#[derive(Debug, Default, Clone)]
pub struct LiveKitTransport;

impl LiveKitTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaTransport for LiveKitTransport {
    async fn connect(
        &self,
        url: &str,
        token: &str,
        options: MediaOptions,
        sink: MediaSink,
    ) -> Result<Arc<dyn MediaConnection>, VoiceError> {
        let (room, room_events) = Room::connect(url, token, RoomOptions::default())
            .await
            .map_err(|e| VoiceError::Media(e.to_string()))?;
        info!(room = %room.name(), "media connected");

        let (mode_tx, mode_rx) = watch::channel(options.noise_cancellation);
        let events_task = tokio::spawn(pump_room_events(room_events, sink, mode_rx));

        Ok(Arc::new(LiveKitConnection {
            room: Arc::new(room),
            outbound: Mutex::new(None),
            mode_tx,
            events_task,
        }))
    }
}

/// The agent's published track and the source feeding it.
struct Outbound {
    sample_rate: u32,
    channels: u32,
    source: NativeAudioSource,
    track: LocalAudioTrack,
}

struct LiveKitConnection {
    room: Arc<Room>,
    outbound: Mutex<Option<Outbound>>,
    mode_tx: watch::Sender<NoiseCancellation>,
    events_task: JoinHandle<()>,
}

impl LiveKitConnection {
    async fn publish_track(&self, sample_rate: u32, channels: u32) -> Result<Outbound, VoiceError> {
        let source = NativeAudioSource::new(
            AudioSourceOptions::default(),
            sample_rate,
            channels,
            OUTPUT_QUEUE_MS,
        );
        let track = LocalAudioTrack::create_audio_track(
            AGENT_TRACK_NAME,
            RtcAudioSource::Native(source.clone()),
        );
        self.room
            .local_participant()
            .publish_track(LocalTrack::Audio(track.clone()), TrackPublishOptions::default())
            .await
            .map_err(|e| VoiceError::Media(e.to_string()))?;
        debug!(sample_rate, channels, "published agent audio track");

        Ok(Outbound {
            sample_rate,
            channels,
            source,
            track,
        })
    }
}

#[async_trait]
impl MediaConnection for LiveKitConnection {
    async fn publish_audio(&self, frame: &AudioFrame) -> Result<(), VoiceError> {
        let channels = u32::from(frame.channels.max(1));
        let mut slot = self.outbound.lock().await;

        let outbound = match slot.take() {
            Some(out) if out.sample_rate == frame.sample_rate && out.channels == channels => out,
            previous => {
                // A format change needs a fresh source.
                if let Some(old) = previous {
                    let _ = self
                        .room
                        .local_participant()
                        .unpublish_track(&old.track.sid())
                        .await;
                }
                self.publish_track(frame.sample_rate, channels).await?
            }
        };

        // The source takes 10 ms frames.
        let per_channel = (frame.sample_rate / 100).max(1);
        let chunk_len = (per_channel * channels) as usize;
        let mut result = Ok(());
        for chunk in frame.samples.chunks(chunk_len) {
            let mut data = chunk.to_vec();
            data.resize(chunk_len, 0);
            let rtc_frame = RtcAudioFrame {
                data: Cow::Owned(data),
                sample_rate: frame.sample_rate,
                num_channels: channels,
                samples_per_channel: per_channel,
            };
            if let Err(e) = outbound.source.capture_frame(&rtc_frame).await {
                result = Err(VoiceError::Media(e.to_string()));
                break;
            }
        }

        *slot = Some(outbound);
        result
    }

    fn set_noise_cancellation(&self, mode: NoiseCancellation) {
        self.mode_tx.send_replace(mode);
    }

    fn close(&self) {
        self.events_task.abort();
        let room = Arc::clone(&self.room);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = room.close().await {
                        warn!(error = %e, "failed to close LiveKit room cleanly");
                    }
                });
            }
            Err(_) => warn!("no runtime available to close LiveKit room"),
        }
    }
}

/// Follows room events until the room goes away, feeding every subscribed
/// audio track into `sink`.
async fn pump_room_events(
    mut events: mpsc::UnboundedReceiver<RoomEvent>,
    sink: MediaSink,
    mode_rx: watch::Receiver<NoiseCancellation>,
) {
    let mut tracks: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            RoomEvent::TrackSubscribed {
                track: RemoteTrack::Audio(track),
                participant,
                ..
            } => {
                let identity = participant.identity().0;
                let sid = track.sid().to_string();
                info!(room = %sink.room_name(), participant = %identity, track = %sid, "subscribed to audio");
                let task = tokio::spawn(forward_track(track, identity, sink.clone(), mode_rx.clone()));
                if let Some(previous) = tracks.insert(sid, task) {
                    previous.abort();
                }
            }
            RoomEvent::TrackUnsubscribed { track, .. } => {
                if let Some(task) = tracks.remove(&track.sid().to_string()) {
                    task.abort();
                }
            }
            RoomEvent::Disconnected { reason } => {
                debug!(room = %sink.room_name(), reason = ?reason, "room disconnected");
                break;
            }
            _ => {}
        }
    }

    for (_, task) in tracks {
        task.abort();
    }
    sink.disconnected();
}

/// Resamples one remote track to mono 16 kHz, applies the selected noise
/// processing, and delivers it frame by frame.
async fn forward_track(
    track: RemoteAudioTrack,
    identity: String,
    sink: MediaSink,
    mut mode_rx: watch::Receiver<NoiseCancellation>,
) {
    let mut stream = NativeAudioStream::new(track.rtc_track(), INPUT_SAMPLE_RATE as i32, 1);
    let mut processor = NoiseProcessor::new(*mode_rx.borrow_and_update());

    while let Some(frame) = stream.next().await {
        if mode_rx.has_changed().unwrap_or(false) {
            processor = NoiseProcessor::new(*mode_rx.borrow_and_update());
        }

        let mut samples = frame.data.into_owned();
        processor.process(&mut samples, frame.sample_rate, frame.num_channels);
        let channels = u16::try_from(frame.num_channels).unwrap_or(1);
        sink.deliver(&identity, AudioFrame::new(samples, frame.sample_rate, channels));
    }
    debug!(participant = %identity, "remote audio track ended");
}

/// WebRTC audio processing for one incoming track.
struct NoiseProcessor {
    apm: Option<AudioProcessingModule>,
}

impl NoiseProcessor {
    fn new(mode: NoiseCancellation) -> Self {
        let apm = ProcessingSettings::for_mode(mode).map(|s| {
            AudioProcessingModule::new(
                s.echo_cancellation,
                s.gain_control,
                s.high_pass_filter,
                s.noise_suppression,
            )
        });
        Self { apm }
    }

    fn process(&mut self, samples: &mut [i16], sample_rate: u32, channels: u32) {
        let Some(apm) = self.apm.as_mut() else {
            return;
        };
        // The processing module only accepts 10 ms frames.
        if samples.len() != (sample_rate / 100 * channels) as usize {
            return;
        }
        if let Err(e) = apm.process_stream(samples, sample_rate as i32, channels as i32) {
            debug!(error = %e, "noise processing skipped a frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (MediaSink, broadcast::Receiver<RemoteAudio>, watch::Receiver<ConnectionState>) {
        let (audio_tx, audio_rx) = broadcast::channel(8);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        (
            MediaSink::new("unit-room".into(), audio_tx, Arc::new(state_tx)),
            audio_rx,
            state_rx,
        )
    }

    #[test]
    fn disabled_mode_skips_processing() {
        assert_eq!(ProcessingSettings::for_mode(NoiseCancellation::Disabled), None);
    }

    #[test]
    fn every_enabled_mode_suppresses_noise() {
        for mode in [NoiseCancellation::Nc, NoiseCancellation::Bvc] {
            let settings = ProcessingSettings::for_mode(mode).unwrap();
            assert!(settings.noise_suppression, "{} must suppress noise", mode);
            assert!(settings.high_pass_filter);
            assert!(!settings.echo_cancellation);
        }
        assert!(ProcessingSettings::for_mode(NoiseCancellation::Bvc).unwrap().gain_control);
        assert!(!ProcessingSettings::for_mode(NoiseCancellation::Nc).unwrap().gain_control);
    }

    #[tokio::test]
    async fn sink_delivers_until_disconnected() {
        let (sink, mut audio_rx, state_rx) = sink();
        sink.deliver("alice", AudioFrame::new(vec![1; 160], 16000, 1));
        let heard = audio_rx.recv().await.unwrap();
        assert_eq!(heard.participant_identity, "alice");

        sink.disconnected();
        assert_eq!(*state_rx.borrow(), ConnectionState::Closed);

        sink.deliver("alice", AudioFrame::new(vec![1; 160], 16000, 1));
        assert!(audio_rx.try_recv().is_err());
    }
}
