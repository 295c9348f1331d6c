use super::{ImageDelivery, ImageSource, SourceInfo};
use crate::bus::{ImageEncoding, ImageMessage, Registration, IMAGE_DATA_KIND};
use crate::errors::CaptureError;
use crate::timing::PTSClock;
use crate::types::SourceOrigin;
use nokhwa::{
    pixel_format::RgbFormat,
    query,
    utils::{ApiBackend, RequestedFormat, RequestedFormatType},
    CallbackCamera,
};
use std::sync::Mutex;

/// Cameras attached to this machine, opened through nokhwa.
///
/// Devices are listed by their human-readable name.
#[derive(Debug, Clone, Default)]
pub struct NativeDeviceSource {
    clock: PTSClock,
}

impl NativeDeviceSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageSource for NativeDeviceSource {
    fn origin(&self) -> SourceOrigin {
        SourceOrigin::Device
    }

    fn list(&self) -> Result<Vec<SourceInfo>, CaptureError> {
        let cameras = query(ApiBackend::Auto)
            .map_err(|e| CaptureError::Registry(format!("failed to query cameras: {}", e)))?;
        Ok(cameras
            .into_iter()
            .map(|info| SourceInfo {
                name: info.human_name(),
                kind: IMAGE_DATA_KIND.to_string(),
            })
            .collect())
    }

    fn subscribe(
        &self,
        name: &str,
        delivery: ImageDelivery,
    ) -> Result<Registration, CaptureError> {
        let subscribe_err = |reason: String| CaptureError::Subscribe {
            source_name: name.to_string(),
            reason,
        };

        let info = query(ApiBackend::Auto)
            .map_err(|e| CaptureError::Registry(e.to_string()))?
            .into_iter()
            .find(|info| info.human_name() == name)
            .ok_or_else(|| CaptureError::SourceNotFound(name.to_string()))?;

        let clock = self.clock.clone();
        let device = name.to_string();
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
        let mut camera = CallbackCamera::new(info.index().clone(), requested, move |buffer| {
            match buffer.decode_image::<RgbFormat>() {
                Ok(rgb) => {
                    let (width, height) = rgb.dimensions();
                    delivery(ImageMessage::packed(
                        width,
                        height,
                        ImageEncoding::Rgb8,
                        rgb.into_raw(),
                        clock.now_ns(),
                    ));
                }
                Err(e) => log::warn!("failed to decode frame from '{}': {}", device, e),
            }
        })
        .map_err(|e| subscribe_err(format!("failed to open camera: {}", e)))?;

        camera
            .open_stream()
            .map_err(|e| subscribe_err(format!("failed to start stream: {}", e)))?;
        log::info!("opened capture device '{}'", name);

        let camera = Mutex::new(camera);
        let device = name.to_string();
        Ok(Registration::new(name, move || {
            if let Ok(mut camera) = camera.lock() {
                if let Err(e) = camera.stop_stream() {
                    log::warn!("failed to stop capture device '{}': {}", device, e);
                }
            }
        }))
    }
}
