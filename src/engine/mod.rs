//! Seam to the real-time communication engine.
//!
//! Transport, codecs and the cryptographic handshake live behind these
//! traits. The orchestrator only creates tracks and sessions through a
//! [`ConnectionFactory`] and drives negotiation through [`PeerSession`].

pub mod context;
pub mod loopback;

pub use context::{ContextHandle, ExecutionContext};
pub use loopback::{LoopbackEngine, LoopbackSession};

use crate::errors::{CaptureError, EngineError};
use crate::orchestrator::SessionObserver;
use crate::trace::TraceLevel;
use crate::types::{
    Capability, DataBuffer, DataChannelSpec, FlushStats, IceServer, MediaConstraints, VideoFrame,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Receives converted frames from a capturer.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &VideoFrame);
}

/// Receives decoded audio from the local audio track.
pub trait AudioSink: Send + Sync {
    fn on_audio(&self, samples: &[i16], sample_rate: u32, channels: u16, timestamp_ns: u64);
}

/// Pull side of a video source, as the engine drives it.
pub trait VideoCapturer: Send + Sync {
    fn start_capture(&self, capability: &Capability) -> Result<(), CaptureError>;
    fn stop_capture(&self) -> Result<(), CaptureError>;
    fn capture_started(&self) -> bool;
    fn capture_settings(&self) -> Capability;
    fn register_sink(&self, sink: Arc<dyn FrameSink>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "offer" => Ok(SdpType::Offer),
            "pranswer" => Ok(SdpType::Pranswer),
            "answer" => Ok(SdpType::Answer),
            "rollback" => Ok(SdpType::Rollback),
            other => Err(EngineError::Rejected(format!("unknown sdp type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub sdp_mid: String,
    pub sdp_mline_index: u16,
    pub candidate: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

/// Settings handed to the engine when the factory is created.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub trace_level: TraceLevel,
    pub ice_servers: Vec<IceServer>,
}

/// The two execution contexts the engine runs on.
#[derive(Clone)]
pub struct EngineContexts {
    pub worker: ContextHandle,
    pub signaling: ContextHandle,
}

/// Everything needed to create one peer session.
pub struct SessionInit {
    pub peer_id: String,
    pub stream_label: String,
    pub tracks: Vec<Arc<dyn MediaTrack>>,
    pub constraints: MediaConstraints,
    pub data_channels: Vec<DataChannelSpec>,
    pub ice_servers: Vec<IceServer>,
    pub observer: SessionObserver,
}

pub trait RtcEngine: Send + Sync {
    fn name(&self) -> &str;

    fn create_factory(
        &self,
        contexts: &EngineContexts,
        config: &EngineConfig,
    ) -> Result<Arc<dyn ConnectionFactory>, EngineError>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    fn create_audio_track(
        &self,
        label: &str,
        constraints: &MediaConstraints,
        sink: Option<Arc<dyn AudioSink>>,
    ) -> Result<Arc<dyn MediaTrack>, EngineError>;

    fn create_video_track(
        &self,
        label: &str,
        constraints: &MediaConstraints,
        capturer: Arc<dyn VideoCapturer>,
    ) -> Result<Arc<dyn MediaTrack>, EngineError>;

    async fn create_session(&self, init: SessionInit) -> Result<Arc<dyn PeerSession>, EngineError>;
}

/// One negotiated peer connection.
///
/// Local descriptions and candidates produced during negotiation are
/// reported through the [`SessionObserver`] given at creation.
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn create_offer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError>;

    async fn create_answer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    fn has_data_channel(&self, label: &str) -> bool;

    fn send_data(&self, label: &str, buffer: &DataBuffer) -> Result<(), EngineError>;

    /// Collect and reset the session's counters.
    fn flush(&self) -> FlushStats;

    async fn close(&self);
}
