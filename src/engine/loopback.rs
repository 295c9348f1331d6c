//! In-process engine that negotiates with itself.
//!
//! `LoopbackEngine` produces syntactically plausible SDP, echoes one host
//! candidate per local description and records data-channel traffic instead
//! of sending it. Failures can be injected per peer. It backs the CLI demo
//! and the test suite.

use super::{
    AudioSink, ConnectionFactory, EngineConfig, EngineContexts, FrameSink, IceCandidate,
    IceConnectionState, MediaTrack, PeerSession, RtcEngine, SdpType, SessionDescription,
    SessionInit, TrackKind, VideoCapturer,
};
use crate::errors::EngineError;
use crate::orchestrator::SessionObserver;
use crate::types::{
    Capability, DataBuffer, DataChannelSpec, FlushStats, MediaConstraints, PixelFormat, VideoFrame,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const AUDIO_SAMPLE_RATE: u32 = 48_000;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct LoopbackState {
    fail_factory: AtomicBool,
    fail_session_init: Mutex<HashSet<String>>,
    fail_offer: Mutex<HashSet<String>>,
    sessions: Mutex<HashMap<String, Arc<LoopbackSession>>>,
    audio_sinks: Mutex<Vec<(String, Arc<dyn AudioSink>)>>,
    video_frames: Mutex<HashMap<String, Arc<AtomicU64>>>,
    live_factories: AtomicUsize,
    sessions_created: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct LoopbackEngine {
    state: Arc<LoopbackState>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_factory(&self, fail: bool) {
        self.state.fail_factory.store(fail, Ordering::SeqCst);
    }

    /// Make session creation for `peer_id` fail.
    pub fn fail_session_init(&self, peer_id: &str) {
        lock(&self.state.fail_session_init).insert(peer_id.to_string());
    }

    /// Make offer creation for `peer_id` fail.
    pub fn fail_offer(&self, peer_id: &str) {
        lock(&self.state.fail_offer).insert(peer_id.to_string());
    }

    /// The most recent session created for `peer_id`.
    pub fn session(&self, peer_id: &str) -> Option<Arc<LoopbackSession>> {
        lock(&self.state.sessions).get(peer_id).cloned()
    }

    pub fn live_factories(&self) -> usize {
        self.state.live_factories.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> usize {
        self.state.sessions_created.load(Ordering::SeqCst)
    }

    /// Frames the engine received on the video track labelled `label`.
    pub fn video_frames(&self, label: &str) -> u64 {
        lock(&self.state.video_frames)
            .get(label)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Play `samples` out of every audio track that has a sink.
    /// Returns how many sinks received them.
    pub fn feed_audio(&self, samples: &[i16], timestamp_ns: u64) -> usize {
        let sinks = lock(&self.state.audio_sinks).clone();
        for (_, sink) in &sinks {
            sink.on_audio(samples, AUDIO_SAMPLE_RATE, 1, timestamp_ns);
        }
        sinks.len()
    }
}

impl RtcEngine for LoopbackEngine {
    fn name(&self) -> &str {
        "loopback"
    }

    fn create_factory(
        &self,
        contexts: &EngineContexts,
        config: &EngineConfig,
    ) -> Result<Arc<dyn ConnectionFactory>, EngineError> {
        if self.state.fail_factory.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("factory creation disabled".into()));
        }
        log::debug!(
            "loopback factory on '{}'/'{}' with trace mask {:#06x}",
            contexts.worker.name(),
            contexts.signaling.name(),
            config.trace_level.0
        );
        self.state.live_factories.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackFactory {
            state: self.state.clone(),
        }))
    }
}

struct LoopbackFactory {
    state: Arc<LoopbackState>,
}

impl Drop for LoopbackFactory {
    fn drop(&mut self) {
        self.state.live_factories.fetch_sub(1, Ordering::SeqCst);
        lock(&self.state.audio_sinks).clear();
    }
}

struct LoopbackAudioTrack {
    id: String,
}

impl MediaTrack for LoopbackAudioTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }
}

struct FrameCounter(Arc<AtomicU64>);

impl FrameSink for FrameCounter {
    fn on_frame(&self, _frame: &VideoFrame) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Starts its capturer on creation and stops it when dropped.
struct LoopbackVideoTrack {
    id: String,
    capturer: Arc<dyn VideoCapturer>,
}

impl MediaTrack for LoopbackVideoTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Video
    }
}

impl Drop for LoopbackVideoTrack {
    fn drop(&mut self) {
        if let Err(e) = self.capturer.stop_capture() {
            log::error!("failed to stop capturer of track '{}': {}", self.id, e);
        }
    }
}

fn constraint_u32(constraints: &MediaConstraints, key: &str, default: u32) -> u32 {
    constraints
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[async_trait]
impl ConnectionFactory for LoopbackFactory {
    fn create_audio_track(
        &self,
        label: &str,
        _constraints: &MediaConstraints,
        sink: Option<Arc<dyn AudioSink>>,
    ) -> Result<Arc<dyn MediaTrack>, EngineError> {
        let state = &self.state;
        if let Some(sink) = sink {
            lock(&state.audio_sinks).push((label.to_string(), sink));
        }
        Ok(Arc::new(LoopbackAudioTrack {
            id: label.to_string(),
        }))
    }

    fn create_video_track(
        &self,
        label: &str,
        constraints: &MediaConstraints,
        capturer: Arc<dyn VideoCapturer>,
    ) -> Result<Arc<dyn MediaTrack>, EngineError> {
        let state = &self.state;
        let counter = lock(&state.video_frames)
            .entry(label.to_string())
            .or_default()
            .clone();
        capturer.register_sink(Arc::new(FrameCounter(counter)));

        let mut capability = Capability::new(
            constraint_u32(constraints, "maxWidth", DEFAULT_WIDTH),
            constraint_u32(constraints, "maxHeight", DEFAULT_HEIGHT),
            PixelFormat::Rgb24,
        );
        capability.max_fps = constraint_u32(constraints, "maxFrameRate", capability.max_fps);
        capturer
            .start_capture(&capability)
            .map_err(|e| EngineError::Rejected(format!("capturer for '{}': {}", label, e)))?;

        Ok(Arc::new(LoopbackVideoTrack {
            id: label.to_string(),
            capturer,
        }))
    }

    async fn create_session(&self, init: SessionInit) -> Result<Arc<dyn PeerSession>, EngineError> {
        let state = &self.state;
        if lock(&state.fail_session_init).contains(&init.peer_id) {
            return Err(EngineError::Rejected(format!(
                "session init disabled for '{}'",
                init.peer_id
            )));
        }

        let ordinal = state.sessions_created.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let fail_offer = lock(&state.fail_offer).contains(&init.peer_id);
        let session = Arc::new(LoopbackSession {
            peer_id: init.peer_id.clone(),
            ordinal,
            stream_label: init.stream_label,
            track_ids: init
                .tracks
                .iter()
                .map(|t| (t.id().to_string(), t.kind()))
                .collect(),
            channels: init
                .data_channels
                .into_iter()
                .map(|spec| (spec.label.clone(), spec))
                .collect(),
            observer: init.observer,
            fail_offer,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            ice_state: Mutex::new(IceConnectionState::New),
            reaped: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_calls: AtomicU64::new(0),
        });
        lock(&state.sessions).insert(init.peer_id, session.clone());
        Ok(session)
    }
}

/// A loopback peer session, exposed so tests can drive it from the
/// "network" side.
pub struct LoopbackSession {
    peer_id: String,
    ordinal: u64,
    stream_label: String,
    track_ids: Vec<(String, TrackKind)>,
    channels: HashMap<String, DataChannelSpec>,
    observer: SessionObserver,
    fail_offer: bool,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    sent: Mutex<Vec<(String, DataBuffer)>>,
    ice_state: Mutex<IceConnectionState>,
    reaped: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
    close_calls: AtomicU64,
}

impl LoopbackSession {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How many times the owner asked this session to close.
    pub fn close_calls(&self) -> u64 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.local).clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.remote).clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.remote_candidates).clone()
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        *lock(&self.ice_state)
    }

    /// Payloads sent on the channel labelled `label`.
    pub fn sent(&self, label: &str) -> Vec<DataBuffer> {
        lock(&self.sent)
            .iter()
            .filter(|(l, _)| l == label)
            .map(|(_, b)| b.clone())
            .collect()
    }

    /// Simulate an ICE transition reported by the transport.
    pub fn set_ice_connection_state(&self, state: IceConnectionState) {
        *lock(&self.ice_state) = state;
        self.observer.on_ice_connection_change(state);
    }

    /// Simulate data arriving from the remote peer.
    pub fn receive_data(&self, label: &str, buffer: DataBuffer) -> Result<(), EngineError> {
        if !self.channels.contains_key(label) {
            return Err(EngineError::ChannelNotFound(label.to_string()));
        }
        self.observer.on_data(label, buffer);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn render_sdp(&self, sdp_type: SdpType) -> String {
        let mut sdp = String::new();
        let _ = write!(
            sdp,
            "v=0\r\no=crabrtc {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=msid-semantic: WMS {}\r\n",
            self.ordinal, self.stream_label
        );
        for (mid, (id, kind)) in self.track_ids.iter().enumerate() {
            let media = match kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            let _ = write!(
                sdp,
                "m={} 9 UDP/TLS/RTP/SAVPF 0\r\na=mid:{}\r\na=msid:{} {}\r\n",
                media, mid, self.stream_label, id
            );
        }
        if !self.channels.is_empty() {
            let _ = write!(
                sdp,
                "m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:{}\r\n",
                self.track_ids.len()
            );
        }
        let _ = write!(sdp, "a={}\r\n", sdp_type);
        sdp
    }

    fn apply_local(&self, sdp_type: SdpType) -> SessionDescription {
        let desc = SessionDescription {
            sdp_type,
            sdp: self.render_sdp(sdp_type),
        };
        *lock(&self.local) = Some(desc.clone());
        self.observer.on_local_description(desc.clone());
        self.observer.on_ice_candidate(IceCandidate {
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.ordinal,
                50_000 + self.ordinal % 10_000
            ),
        });
        desc
    }
}

#[async_trait]
impl PeerSession for LoopbackSession {
    async fn create_offer(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        if self.fail_offer {
            return Err(EngineError::Rejected("offer creation disabled".into()));
        }
        Ok(self.apply_local(SdpType::Offer))
    }

    async fn create_answer(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        let has_offer = lock(&self.remote)
            .as_ref()
            .map(|d| d.sdp_type == SdpType::Offer)
            .unwrap_or(false);
        if !has_offer {
            return Err(EngineError::Rejected("no remote offer to answer".into()));
        }
        Ok(self.apply_local(SdpType::Answer))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        if !desc.sdp.starts_with("v=") {
            return Err(EngineError::Rejected("malformed session description".into()));
        }
        *lock(&self.remote) = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.ensure_open()?;
        if lock(&self.remote).is_none() {
            return Err(EngineError::Rejected("remote description not set".into()));
        }
        lock(&self.remote_candidates).push(candidate);
        Ok(())
    }

    fn has_data_channel(&self, label: &str) -> bool {
        self.channels.contains_key(label)
    }

    fn send_data(&self, label: &str, buffer: &DataBuffer) -> Result<(), EngineError> {
        self.ensure_open()?;
        if !self.channels.contains_key(label) {
            return Err(EngineError::ChannelNotFound(label.to_string()));
        }
        match self.ice_connection_state() {
            IceConnectionState::Failed
            | IceConnectionState::Disconnected
            | IceConnectionState::Closed => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
            }
            _ => {
                lock(&self.sent).push((label.to_string(), buffer.clone()));
                self.reaped.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn flush(&self) -> FlushStats {
        FlushStats {
            reaped_data_messages: self.reaped.swap(0, Ordering::SeqCst),
            dropped_data_messages: self.dropped.swap(0, Ordering::SeqCst),
        }
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            *lock(&self.ice_state) = IceConnectionState::Closed;
            log::debug!("loopback session for '{}' closed", self.peer_id);
        }
    }
}
