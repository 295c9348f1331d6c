use crate::bus::{AudioMessage, BusMessage, ControlBus, ImageEncoding, ImageMessage, Registration};
use crate::bus::{AUDIO_DATA_KIND, IMAGE_DATA_KIND};
use crate::capture::{CaptureBridge, ImageSource};
use crate::config::BridgeConfig;
use crate::engine::{AudioSink, ConnectionFactory, FrameSink, MediaTrack, VideoCapturer};
use crate::errors::{CaptureError, OpenError};
use crate::types::{SourceOrigin, VideoFrame};
use std::sync::{Arc, Mutex, PoisonError};

pub const STREAM_LABEL: &str = "s1";
pub const DEFAULT_AUDIO_LABEL: &str = "a1";

struct VideoEntry {
    label: String,
    source_name: String,
    track: Arc<dyn MediaTrack>,
    bridge: Arc<CaptureBridge>,
}

/// Republishes converted frames on the bus.
struct FramePublisher {
    bus: Arc<dyn ControlBus>,
    topic: String,
}

impl FrameSink for FramePublisher {
    fn on_frame(&self, frame: &VideoFrame) {
        let image = ImageMessage {
            stamp_ns: frame.timestamp_ns,
            width: frame.width,
            height: frame.height,
            encoding: ImageEncoding::I420,
            step: frame.width,
            data: frame.data.clone(),
        };
        if let Err(e) = self.bus.publish(&self.topic, BusMessage::Image(image)) {
            log::warn!("failed to republish frame on '{}': {}", self.topic, e);
        }
    }
}

struct AudioPublisher {
    bus: Arc<dyn ControlBus>,
    topic: String,
    track_id: String,
}

impl AudioSink for AudioPublisher {
    fn on_audio(&self, samples: &[i16], sample_rate: u32, channels: u16, timestamp_ns: u64) {
        let message = AudioMessage {
            track_id: self.track_id.clone(),
            sample_rate,
            channels,
            timestamp_ns,
            samples: samples.to_vec(),
        };
        if let Err(e) = self.bus.publish(&self.topic, BusMessage::Audio(message)) {
            log::warn!("failed to republish audio on '{}': {}", self.topic, e);
        }
    }
}

/// Where the pipeline finds its video sources.
pub struct PipelineSources<'a> {
    pub topics: &'a dyn ImageSource,
    pub devices: Option<&'a dyn ImageSource>,
}

/// The tracks every session shares: one audio track and the configured
/// video tracks. Built once per open; never changed while sessions exist.
pub struct LocalMediaPipeline {
    stream_label: String,
    audio_label: String,
    audio: Arc<dyn MediaTrack>,
    video: Vec<VideoEntry>,
    publications: Mutex<Vec<Registration>>,
}

impl LocalMediaPipeline {
    pub fn build(
        config: &BridgeConfig,
        factory: &dyn ConnectionFactory,
        bus: &Arc<dyn ControlBus>,
        sources: PipelineSources<'_>,
    ) -> Result<Self, OpenError> {
        let mut publications = Vec::new();
        let mut video = Vec::with_capacity(config.cameras.len());

        for (i, camera) in config.cameras.iter().enumerate() {
            let label = if camera.label.is_empty() {
                format!("v{}", i + 1)
            } else {
                camera.label.clone()
            };

            let source = match camera.origin {
                SourceOrigin::Topic => sources.topics,
                SourceOrigin::Device => sources.devices.ok_or_else(|| {
                    OpenError::PipelineBuild(format!(
                        "no capture device support for '{}'",
                        camera.qualified_name()
                    ))
                })?,
            };

            let bridge = CaptureBridge::init(source, &camera.name).map_err(|e| {
                OpenError::PipelineBuild(format!("video source '{}': {}", camera.qualified_name(), e))
            })?;
            let bridge = Arc::new(bridge);

            if camera.publish {
                let topic = crate::bus::qualify(&config.namespace, &format!("local/video_{}", label));
                let registration = bus
                    .advertise_topic(&topic, IMAGE_DATA_KIND)
                    .map_err(|e| OpenError::PipelineBuild(e.to_string()))?;
                publications.push(registration);
                bridge.register_sink(Arc::new(FramePublisher {
                    bus: bus.clone(),
                    topic,
                }));
            }

            let capturer: Arc<dyn VideoCapturer> = bridge.clone();
            let track = factory
                .create_video_track(&label, &camera.constraints, capturer)
                .map_err(|e| OpenError::PipelineBuild(format!("video track '{}': {}", label, e)))?;
            log::info!("video track '{}' from '{}'", label, camera.qualified_name());

            video.push(VideoEntry {
                label,
                source_name: camera.qualified_name(),
                track,
                bridge,
            });
        }

        let mic = &config.microphone;
        let audio_label = if mic.label.is_empty() {
            DEFAULT_AUDIO_LABEL.to_string()
        } else {
            mic.label.clone()
        };
        let audio_sink: Option<Arc<dyn AudioSink>> = if mic.publish {
            let topic = crate::bus::qualify(&config.namespace, &format!("local/audio_{}", audio_label));
            let registration = bus
                .advertise_topic(&topic, AUDIO_DATA_KIND)
                .map_err(|e| OpenError::PipelineBuild(e.to_string()))?;
            publications.push(registration);
            Some(Arc::new(AudioPublisher {
                bus: bus.clone(),
                topic,
                track_id: audio_label.clone(),
            }))
        } else {
            None
        };
        let audio = factory
            .create_audio_track(&audio_label, &mic.constraints, audio_sink)
            .map_err(|e| OpenError::PipelineBuild(format!("audio track '{}': {}", audio_label, e)))?;
        log::info!("audio track '{}'", audio_label);

        Ok(Self {
            stream_label: STREAM_LABEL.to_string(),
            audio_label,
            audio,
            video,
            publications: Mutex::new(publications),
        })
    }

    pub fn stream_label(&self) -> &str {
        &self.stream_label
    }

    pub fn audio_label(&self) -> &str {
        &self.audio_label
    }

    pub fn video_labels(&self) -> Vec<String> {
        self.video.iter().map(|v| v.label.clone()).collect()
    }

    /// All tracks, audio first.
    pub fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        std::iter::once(self.audio.clone())
            .chain(self.video.iter().map(|v| v.track.clone()))
            .collect()
    }

    pub fn bridge(&self, label: &str) -> Option<Arc<CaptureBridge>> {
        self.video
            .iter()
            .find(|v| v.label == label)
            .map(|v| v.bridge.clone())
    }

    /// Stop every capture bridge and withdraw republished topics.
    ///
    /// Blocks until every polling thread has been joined.
    pub fn release(&self) -> Result<(), CaptureError> {
        let mut first_err = None;
        for entry in &self.video {
            if let Err(e) = entry.bridge.stop_capture() {
                log::error!("failed to stop '{}' ({}): {}", entry.label, entry.source_name, e);
                first_err.get_or_insert(e);
            }
        }
        self.publications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
