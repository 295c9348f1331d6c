//! Pull-based capturer over a push-delivered image source.
//!
//! Images are delivered on the source's thread into a one-slot queue that
//! keeps only the newest image. A dedicated polling thread services the
//! queue while the bridge is capturing: it converts each image to I420,
//! records the produced size in the capture settings and hands the frame to
//! the registered sinks. Conversion finishes before any sink sees the
//! buffer.
//!
//! ```text
//!   source thread ──push──▶ [queue(1)] ──poll──▶ convert ──▶ sinks
//!                              ▲                      │
//!            start/stop ───────┴── CaptureCell ◀──────┘
//! ```

use super::convert;
use super::{ImageDelivery, ImageSource};
use crate::bus::{ImageMessage, Registration};
use crate::engine::{FrameSink, VideoCapturer};
use crate::errors::CaptureError;
use crate::types::{Capability, PixelFormat, VideoFrame};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    Capturing,
}

struct CaptureCell {
    state: CaptureState,
    /// Profile passed to the last successful `start_capture`.
    requested: Capability,
    /// Last applied settings; size and format follow produced frames.
    settings: Capability,
}

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

struct BridgeInner {
    source_name: String,
    cell: Mutex<CaptureCell>,
    tx: Sender<ImageMessage>,
    rx: Receiver<ImageMessage>,
    sinks: RwLock<Vec<Arc<dyn FrameSink>>>,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BridgeInner {
    fn cell(&self) -> MutexGuard<'_, CaptureCell> {
        lock(&self.cell)
    }

    fn is_capturing(&self) -> bool {
        self.cell().state == CaptureState::Capturing
    }

    /// Runs on the source's delivery thread. The cell stays locked across
    /// the push so a concurrent stop cannot drain between check and push.
    fn deliver(&self, image: ImageMessage) {
        let cell = self.cell();
        if cell.state != CaptureState::Capturing {
            return;
        }
        let mut pending = image;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    pending = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Runs on the polling thread.
    fn on_image(&self, image: ImageMessage) {
        let data = match convert::to_i420(&image) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("dropping image from '{}': {}", self.source_name, e);
                return;
            }
        };

        {
            let mut cell = self.cell();
            if cell.state != CaptureState::Capturing {
                return;
            }
            cell.settings.width = image.width;
            cell.settings.height = image.height;
            cell.settings.format = PixelFormat::I420;
        }

        let frame = VideoFrame {
            data,
            width: image.width,
            height: image.height,
            format: PixelFormat::I420,
            timestamp_ns: image.stamp_ns,
        };
        let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner).clone();
        for sink in &sinks {
            sink.on_frame(&frame);
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn poll(&self, stop: &AtomicBool) {
        log::debug!("capture thread for '{}' running", self.source_name);
        while !stop.load(Ordering::Acquire) && self.is_capturing() {
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(image) => self.on_image(image),
                Err(RecvTimeoutError::Timeout) => thread::yield_now(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::debug!("capture thread for '{}' exiting", self.source_name);
    }

    fn drain(&self) -> u64 {
        let mut count = 0;
        while self.rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }
}

/// A [`VideoCapturer`] fed by an [`ImageSource`].
///
/// At most one polling thread exists per bridge: `start_capture` and
/// `stop_capture` serialize on the worker slot and hold it for their whole
/// duration, including the join.
pub struct CaptureBridge {
    inner: Arc<BridgeInner>,
    control: Mutex<Option<Worker>>,
    subscription: Mutex<Option<Registration>>,
    thread_id: Mutex<Option<ThreadId>>,
}

impl CaptureBridge {
    /// Verify `name` is currently published by `source` and subscribe to it.
    pub fn init(source: &dyn ImageSource, name: &str) -> Result<Self, CaptureError> {
        if !source.contains(name)? {
            return Err(CaptureError::SourceNotFound(name.to_string()));
        }

        let (tx, rx) = bounded(1);
        let inner = Arc::new(BridgeInner {
            source_name: name.to_string(),
            cell: Mutex::new(CaptureCell {
                state: CaptureState::Stopped,
                requested: Capability::default(),
                settings: Capability::default(),
            }),
            tx,
            rx,
            sinks: RwLock::new(Vec::new()),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        });

        let weak: Weak<BridgeInner> = Arc::downgrade(&inner);
        let delivery: ImageDelivery = Arc::new(move |image| {
            if let Some(inner) = weak.upgrade() {
                inner.deliver(image);
            }
        });
        let subscription = source.subscribe(name, delivery)?;
        log::info!("capture bridge subscribed to '{}'", name);

        Ok(Self {
            inner,
            control: Mutex::new(None),
            subscription: Mutex::new(Some(subscription)),
            thread_id: Mutex::new(None),
        })
    }

    pub fn source_name(&self) -> &str {
        &self.inner.source_name
    }

    pub fn state(&self) -> CaptureState {
        self.inner.cell().state
    }

    /// Identity of the current polling thread, `None` while stopped.
    pub fn capture_thread_id(&self) -> Option<ThreadId> {
        *lock(&self.thread_id)
    }

    /// Images discarded without reaching a sink: replaced in the queue by a
    /// newer image or cleared by `stop_capture`.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered_frames(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    fn spawn_worker(&self) -> Result<Worker, CaptureError> {
        let stop = Arc::new(AtomicBool::new(false));
        let inner = self.inner.clone();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(format!("crabrtc-capture-{}", self.inner.source_name))
            .spawn(move || inner.poll(&flag))
            .map_err(|e| CaptureError::ThreadSpawn(e.to_string()))?;
        *lock(&self.thread_id) = Some(handle.thread().id());
        Ok(Worker { handle, stop })
    }

    fn stop_locked(&self, control: &mut Option<Worker>) -> Result<(), CaptureError> {
        if let Some(worker) = control.take() {
            worker.stop.store(true, Ordering::Release);
            *lock(&self.thread_id) = None;
            if worker.handle.join().is_err() {
                log::error!(
                    "capture thread for '{}' could not be joined",
                    self.inner.source_name
                );
                self.inner.cell().state = CaptureState::Stopped;
                return Err(CaptureError::ThreadJoin(self.inner.source_name.clone()));
            }
        }

        let mut cell = self.inner.cell();
        if cell.state == CaptureState::Capturing {
            cell.state = CaptureState::Stopped;
            let discarded = self.inner.drain();
            if discarded > 0 {
                self.inner.dropped.fetch_add(discarded, Ordering::Relaxed);
                log::debug!(
                    "discarded {} buffered frame(s) from '{}'",
                    discarded,
                    self.inner.source_name
                );
            }
            log::info!("capture stopped for '{}'", self.inner.source_name);
        }
        Ok(())
    }
}

impl VideoCapturer for CaptureBridge {
    fn start_capture(&self, capability: &Capability) -> Result<(), CaptureError> {
        let mut control = lock(&self.control);

        {
            let cell = self.inner.cell();
            if cell.state == CaptureState::Capturing
                && control.is_some()
                && cell.requested.same_profile(capability)
            {
                return Ok(());
            }
        }

        if control.is_some() || self.inner.is_capturing() {
            log::info!(
                "capture profile for '{}' changed, restarting",
                self.inner.source_name
            );
            self.stop_locked(&mut control)?;
        }

        {
            let mut cell = self.inner.cell();
            let stale = self.inner.drain();
            if stale > 0 {
                self.inner.dropped.fetch_add(stale, Ordering::Relaxed);
            }
            cell.state = CaptureState::Capturing;
            cell.requested = capability.clone();
            cell.settings = capability.clone();
        }

        match self.spawn_worker() {
            Ok(worker) => {
                *control = Some(worker);
                log::info!(
                    "capture started for '{}' at {}x{} {}",
                    self.inner.source_name,
                    capability.width,
                    capability.height,
                    capability.format
                );
                Ok(())
            }
            Err(e) => {
                self.inner.cell().state = CaptureState::Stopped;
                Err(e)
            }
        }
    }

    fn stop_capture(&self) -> Result<(), CaptureError> {
        let mut control = lock(&self.control);
        self.stop_locked(&mut control)
    }

    fn capture_started(&self) -> bool {
        self.inner.is_capturing()
    }

    fn capture_settings(&self) -> Capability {
        self.inner.cell().settings.clone()
    }

    fn register_sink(&self, sink: Arc<dyn FrameSink>) {
        self.inner
            .sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }
}

impl Drop for CaptureBridge {
    fn drop(&mut self) {
        lock(&self.subscription).take();
        if let Err(e) = self.stop_capture() {
            log::error!("capture bridge for '{}' dropped uncleanly: {}", self.inner.source_name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ControlBus, ImageEncoding, LocalBus, IMAGE_DATA_KIND};
    use crate::capture::TopicImageSource;

    #[test]
    fn test_init_requires_published_source() {
        let bus = LocalBus::new();
        let source = TopicImageSource::new(Arc::new(bus));
        assert!(matches!(
            CaptureBridge::init(&source, "missing"),
            Err(CaptureError::SourceNotFound(_))
        ));
    }

    #[test]
    fn test_deliveries_while_stopped_are_discarded() {
        let bus = LocalBus::new();
        let _adv = bus.advertise_topic("cam", IMAGE_DATA_KIND).unwrap();
        let source = TopicImageSource::new(Arc::new(bus.clone()));
        let bridge = CaptureBridge::init(&source, "cam").unwrap();

        let img = ImageMessage::packed(2, 2, ImageEncoding::Rgb8, vec![0u8; 12], 1);
        bridge.inner.deliver(img);
        assert!(bridge.inner.rx.is_empty());
        assert_eq!(bridge.state(), CaptureState::Stopped);
        assert!(bridge.capture_thread_id().is_none());
    }

    #[test]
    fn test_queue_keeps_newest() {
        let bus = LocalBus::new();
        let _adv = bus.advertise_topic("cam", IMAGE_DATA_KIND).unwrap();
        let source = TopicImageSource::new(Arc::new(bus));
        let bridge = CaptureBridge::init(&source, "cam").unwrap();

        bridge.inner.cell().state = CaptureState::Capturing;
        for stamp in 1..=3 {
            let img = ImageMessage::packed(1, 1, ImageEncoding::Mono8, vec![0u8], stamp);
            bridge.inner.deliver(img);
        }
        assert_eq!(bridge.inner.rx.len(), 1);
        assert_eq!(bridge.dropped_frames(), 2);
        assert_eq!(bridge.inner.rx.try_recv().unwrap().stamp_ns, 3);
        bridge.inner.cell().state = CaptureState::Stopped;
    }

    #[test]
    fn test_stop_discards_buffered_frame() {
        let bus = LocalBus::new();
        let _adv = bus.advertise_topic("cam", IMAGE_DATA_KIND).unwrap();
        let source = TopicImageSource::new(Arc::new(bus));
        let bridge = CaptureBridge::init(&source, "cam").unwrap();

        bridge.inner.cell().state = CaptureState::Capturing;
        let img = ImageMessage::packed(1, 1, ImageEncoding::Mono8, vec![0u8], 7);
        bridge.inner.deliver(img);
        assert_eq!(bridge.inner.rx.len(), 1);

        bridge.stop_capture().unwrap();
        assert!(bridge.inner.rx.is_empty());
        assert_eq!(bridge.dropped_frames(), 1);
        assert_eq!(bridge.delivered_frames(), 0);

        let late = ImageMessage::packed(1, 1, ImageEncoding::Mono8, vec![0u8], 8);
        bridge.inner.deliver(late);
        assert!(bridge.inner.rx.is_empty());
    }
}
