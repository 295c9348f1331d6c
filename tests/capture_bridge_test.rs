//! Capture bridge integration tests
//!
//! Exercises the bridge against image topics on a `LocalBus`: start/stop
//! state machine, polling thread identity and I420 conversion.

use crabrtc::bus::{ImageEncoding, LocalBus};
use crabrtc::capture::convert::i420_size;
use crabrtc::capture::{CaptureBridge, CaptureSourceRegistry, CaptureState, TopicImageSource};
use crabrtc::engine::{FrameSink, VideoCapturer};
use crabrtc::errors::CaptureError;
use crabrtc::testing::SyntheticCamera;
use crabrtc::types::{Capability, PixelFormat, VideoFrame};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const TOPIC: &str = "front/image_raw";

#[derive(Default)]
struct CollectingSink {
    frames: Mutex<Vec<(u32, u32, PixelFormat, usize)>>,
    count: AtomicU64,
}

impl FrameSink for CollectingSink {
    fn on_frame(&self, frame: &VideoFrame) {
        self.frames
            .lock()
            .unwrap()
            .push((frame.width, frame.height, frame.format, frame.data.len()));
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

fn setup(width: u32, height: u32) -> (Arc<LocalBus>, SyntheticCamera, CaptureBridge) {
    let bus = Arc::new(LocalBus::new());
    let camera = SyntheticCamera::advertise(bus.clone(), TOPIC, width, height).unwrap();
    let source = TopicImageSource::new(bus.clone());
    let bridge = CaptureBridge::init(&source, TOPIC).unwrap();
    (bus, camera, bridge)
}

/// Publish until `sink` has seen `n` frames or give up.
fn pump(camera: &mut SyntheticCamera, sink: &CollectingSink, n: u64) -> bool {
    for _ in 0..500 {
        if sink.count.load(Ordering::SeqCst) >= n {
            return true;
        }
        camera.publish_next().unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_same_capability_keeps_polling_thread() {
    let (_bus, _camera, bridge) = setup(64, 48);
    let cap = Capability::new(640, 480, PixelFormat::Rgb24);

    bridge.start_capture(&cap).unwrap();
    let first = bridge.capture_thread_id().expect("polling thread");
    assert_ne!(first, thread::current().id());

    let mut same = cap.clone();
    same.max_fps = 15;
    bridge.start_capture(&same).unwrap();
    assert_eq!(bridge.capture_thread_id(), Some(first));
    assert_eq!(bridge.state(), CaptureState::Capturing);

    bridge.stop_capture().unwrap();
}

#[test]
fn test_changed_capability_restarts_polling_thread() {
    let (_bus, _camera, bridge) = setup(64, 48);

    bridge
        .start_capture(&Capability::new(640, 480, PixelFormat::Rgb24))
        .unwrap();
    let first = bridge.capture_thread_id().unwrap();

    bridge
        .start_capture(&Capability::new(320, 240, PixelFormat::Rgb24))
        .unwrap();
    let second = bridge.capture_thread_id().unwrap();
    assert_ne!(first, second);
    assert!(bridge.capture_started());

    bridge.stop_capture().unwrap();
}

#[test]
fn test_restart_after_frames_does_not_compare_produced_settings() {
    let (_bus, mut camera, bridge) = setup(64, 48);
    let sink = Arc::new(CollectingSink::default());
    bridge.register_sink(sink.clone());

    let cap = Capability::new(640, 480, PixelFormat::Rgb24);
    bridge.start_capture(&cap).unwrap();
    assert!(pump(&mut camera, &sink, 1));
    let thread_id = bridge.capture_thread_id();

    // settings now describe the produced frames, the request is unchanged
    assert_eq!(bridge.capture_settings().width, 64);
    bridge.start_capture(&cap).unwrap();
    assert_eq!(bridge.capture_thread_id(), thread_id);

    bridge.stop_capture().unwrap();
}

#[test]
fn test_stop_when_stopped_is_a_no_op() {
    let (_bus, _camera, bridge) = setup(8, 8);
    assert_eq!(bridge.state(), CaptureState::Stopped);
    bridge.stop_capture().unwrap();
    bridge.stop_capture().unwrap();
    assert!(!bridge.capture_started());
    assert!(bridge.capture_thread_id().is_none());
}

#[test]
fn test_frames_are_converted_before_sinks_see_them() {
    let (_bus, mut camera, bridge) = setup(33, 17);
    let sink = Arc::new(CollectingSink::default());
    bridge.register_sink(sink.clone());

    bridge
        .start_capture(&Capability::new(640, 480, PixelFormat::Rgb24))
        .unwrap();
    assert!(pump(&mut camera, &sink, 2));

    for &(w, h, format, len) in sink.frames.lock().unwrap().iter() {
        assert_eq!((w, h), (33, 17));
        assert_eq!(format, PixelFormat::I420);
        assert_eq!(len, i420_size(33, 17));
    }

    let settings = bridge.capture_settings();
    assert_eq!((settings.width, settings.height), (33, 17));
    assert_eq!(settings.format, PixelFormat::I420);
    assert!(bridge.delivered_frames() >= 2);

    bridge.stop_capture().unwrap();
}

#[test]
fn test_every_packed_encoding_converts() {
    for encoding in [
        ImageEncoding::Rgb8,
        ImageEncoding::Bgr8,
        ImageEncoding::Rgba8,
        ImageEncoding::Bgra8,
        ImageEncoding::Mono8,
    ] {
        let bus = Arc::new(LocalBus::new());
        let mut camera = SyntheticCamera::advertise(bus.clone(), TOPIC, 16, 8)
            .unwrap()
            .with_encoding(encoding);
        let bridge = CaptureBridge::init(&TopicImageSource::new(bus.clone()), TOPIC).unwrap();
        let sink = Arc::new(CollectingSink::default());
        bridge.register_sink(sink.clone());
        bridge
            .start_capture(&Capability::new(16, 8, PixelFormat::Rgb24))
            .unwrap();

        assert!(pump(&mut camera, &sink, 1), "{:?} never converted", encoding);
        assert_eq!(sink.frames.lock().unwrap()[0].3, i420_size(16, 8));
        bridge.stop_capture().unwrap();
    }
}

#[test]
fn test_stopped_bridge_delivers_nothing() {
    let (_bus, mut camera, bridge) = setup(16, 16);
    let sink = Arc::new(CollectingSink::default());
    bridge.register_sink(sink.clone());

    bridge
        .start_capture(&Capability::new(16, 16, PixelFormat::Rgb24))
        .unwrap();
    assert!(pump(&mut camera, &sink, 1));
    bridge.stop_capture().unwrap();

    let seen = sink.count.load(Ordering::SeqCst);
    for _ in 0..10 {
        camera.publish_next().unwrap();
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sink.count.load(Ordering::SeqCst), seen);
    assert_eq!(bridge.state(), CaptureState::Stopped);
}

#[test]
fn test_frames_buffered_at_stop_never_reach_sinks_after_restart() {
    let (_bus, camera, bridge) = setup(8, 8);
    let sink = Arc::new(CollectingSink::default());
    bridge.register_sink(sink.clone());
    let cap = Capability::new(8, 8, PixelFormat::Rgb24);
    let mut camera = Some(camera);

    for cycle in 0..200 {
        bridge.start_capture(&cap).unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let mut publishing = camera.take().unwrap();
        let publisher = thread::spawn(move || {
            while flag.load(Ordering::SeqCst) {
                publishing.publish_next().unwrap();
            }
            publishing
        });
        thread::sleep(Duration::from_millis(1));

        bridge.stop_capture().unwrap();
        running.store(false, Ordering::SeqCst);
        camera = Some(publisher.join().unwrap());

        // restart with nothing publishing: the sinks must stay quiet
        let seen = sink.count.load(Ordering::SeqCst);
        bridge.start_capture(&cap).unwrap();
        thread::sleep(Duration::from_millis(15));
        assert_eq!(
            sink.count.load(Ordering::SeqCst),
            seen,
            "stale frame delivered after restart in cycle {}",
            cycle
        );
        bridge.stop_capture().unwrap();
    }
}

#[test]
fn test_init_needs_published_topic() {
    let bus = Arc::new(LocalBus::new());
    let source = TopicImageSource::new(bus);
    assert!(matches!(
        CaptureBridge::init(&source, TOPIC),
        Err(CaptureError::SourceNotFound(_))
    ));
}

#[test]
fn test_dropping_bridge_joins_thread_and_unsubscribes() {
    let (bus, _camera, bridge) = setup(8, 8);
    bridge
        .start_capture(&Capability::new(8, 8, PixelFormat::Rgb24))
        .unwrap();
    assert_eq!(bus.subscriber_count(TOPIC), 1);
    drop(bridge);
    assert_eq!(bus.subscriber_count(TOPIC), 0);
}

#[test]
fn test_registry_sees_camera_topics() {
    let bus = Arc::new(LocalBus::new());
    let _b = SyntheticCamera::advertise(bus.clone(), "b/image", 8, 8).unwrap();
    let _a = SyntheticCamera::advertise(bus.clone(), "a/image", 8, 8).unwrap();
    let registry = CaptureSourceRegistry::new(Arc::new(TopicImageSource::new(bus.clone())));

    assert_eq!(registry.enumerate().unwrap(), vec!["a/image", "b/image"]);
    assert_eq!(registry.number_of_devices().unwrap(), 2);
    assert_eq!(registry.device_name(1).unwrap(), "b/image");

    let catalog = registry.resolve_capabilities("a/image").unwrap();
    assert_eq!(catalog.len(), 13);
    assert!(catalog.entries().iter().all(|c| c.format == PixelFormat::Rgb24));
    assert!(registry.resolve_capabilities("c/image").is_err());
}
