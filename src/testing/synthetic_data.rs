//! Synthetic sources that stand in for a camera publishing on the bus.

use crate::bus::{
    BusMessage, ControlBus, ImageEncoding, ImageMessage, Registration, IMAGE_DATA_KIND,
};
use crate::errors::BusError;
use crate::timing::PTSClock;
use std::sync::Arc;

/// A gradient test image that changes every frame.
///
/// Packed encodings only; I420 requests fall back to RGB8.
pub fn synthetic_image(
    frame_number: u64,
    width: u32,
    height: u32,
    encoding: ImageEncoding,
    stamp_ns: u64,
) -> ImageMessage {
    let encoding = match encoding {
        ImageEncoding::I420 => ImageEncoding::Rgb8,
        other => other,
    };
    let bpp = encoding.bytes_per_pixel().unwrap_or(3) as usize;
    let mut data = vec![0u8; width as usize * height as usize * bpp];

    // Gradient by position, shifted each frame
    let base = (frame_number % 256) as u8;
    for y in 0..height as usize {
        for x in 0..width as usize {
            let idx = (y * width as usize + x) * bpp;
            let r = base.wrapping_add((x % 256) as u8);
            let g = base.wrapping_add((y % 256) as u8);
            let b = base.wrapping_add(((x + y) % 256) as u8);
            match encoding {
                ImageEncoding::Rgb8 => data[idx..idx + 3].copy_from_slice(&[r, g, b]),
                ImageEncoding::Bgr8 => data[idx..idx + 3].copy_from_slice(&[b, g, r]),
                ImageEncoding::Rgba8 => data[idx..idx + 4].copy_from_slice(&[r, g, b, 255]),
                ImageEncoding::Bgra8 => data[idx..idx + 4].copy_from_slice(&[b, g, r, 255]),
                ImageEncoding::Mono8 | ImageEncoding::I420 => data[idx] = g,
            }
        }
    }

    ImageMessage::packed(width, height, encoding, data, stamp_ns)
}

/// A 440 Hz mono tone at 48 kHz, continuous across frames.
pub fn synthetic_audio(frame_number: u64, samples_per_frame: usize) -> Vec<i16> {
    let sample_rate = 48_000.0;
    let frequency = 440.0;
    (0..samples_per_frame)
        .map(|i| {
            let t = (frame_number as f64 * samples_per_frame as f64 + i as f64) / sample_rate;
            ((2.0 * std::f64::consts::PI * frequency * t).sin() * 0.3 * i16::MAX as f64) as i16
        })
        .collect()
}

/// Publishes synthetic images on an image topic, as an external camera
/// node would.
pub struct SyntheticCamera {
    bus: Arc<dyn ControlBus>,
    topic: String,
    width: u32,
    height: u32,
    encoding: ImageEncoding,
    clock: PTSClock,
    frame_number: u64,
    _advertisement: Registration,
}

impl SyntheticCamera {
    pub fn advertise(
        bus: Arc<dyn ControlBus>,
        topic: &str,
        width: u32,
        height: u32,
    ) -> Result<Self, BusError> {
        let advertisement = bus.advertise_topic(topic, IMAGE_DATA_KIND)?;
        Ok(Self {
            bus,
            topic: topic.to_string(),
            width,
            height,
            encoding: ImageEncoding::Rgb8,
            clock: PTSClock::new(),
            frame_number: 0,
            _advertisement: advertisement,
        })
    }

    pub fn with_encoding(mut self, encoding: ImageEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish the next frame. Returns how many subscribers received it.
    pub fn publish_next(&mut self) -> Result<usize, BusError> {
        let image = synthetic_image(
            self.frame_number,
            self.width,
            self.height,
            self.encoding,
            self.clock.now_ns(),
        );
        self.frame_number += 1;
        self.bus.publish(&self.topic, BusMessage::Image(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;

    #[test]
    fn test_synthetic_image_size() {
        let img = synthetic_image(0, 64, 48, ImageEncoding::Bgra8, 0);
        assert_eq!(img.data.len(), 64 * 48 * 4);
        assert_eq!(img.step, 64 * 4);
        let fallback = synthetic_image(0, 4, 4, ImageEncoding::I420, 0);
        assert_eq!(fallback.encoding, ImageEncoding::Rgb8);
    }

    #[test]
    fn test_frames_differ() {
        let a = synthetic_image(0, 8, 8, ImageEncoding::Rgb8, 0);
        let b = synthetic_image(1, 8, 8, ImageEncoding::Rgb8, 0);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_audio_is_bounded() {
        let samples = synthetic_audio(3, 480);
        assert_eq!(samples.len(), 480);
        assert!(samples.iter().any(|&s| s != 0));
        assert!(samples.iter().all(|&s| s.unsigned_abs() <= (i16::MAX as f64 * 0.3) as u16 + 1));
    }

    #[test]
    fn test_camera_advertises_topic() {
        let bus = Arc::new(LocalBus::new());
        let mut camera = SyntheticCamera::advertise(bus.clone(), "cam/image_raw", 8, 8).unwrap();
        let topics = bus.topics().unwrap();
        assert_eq!(topics[0].name, "cam/image_raw");
        assert_eq!(camera.publish_next().unwrap(), 0);
    }
}
