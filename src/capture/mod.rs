//! Push-delivered image sources and the bridge that turns them into a
//! pull-based capturer.

pub mod bridge;
pub mod convert;
#[cfg(feature = "native-device")]
pub mod device;
pub mod registry;
pub mod source;

pub use bridge::{CaptureBridge, CaptureState};
#[cfg(feature = "native-device")]
pub use device::NativeDeviceSource;
pub use registry::{CapabilityCatalog, CaptureSourceRegistry, RESOLUTION_LADDER};
pub use source::TopicImageSource;

use crate::bus::{ImageMessage, Registration};
use crate::errors::CaptureError;
use crate::types::SourceOrigin;
use serde::Serialize;
use std::sync::Arc;

/// Called once per image, on the source's own delivery thread.
pub type ImageDelivery = Arc<dyn Fn(ImageMessage) + Send + Sync>;

/// A currently published source as reported by the registry query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub name: String,
    pub kind: String,
}

/// A registry of push-delivered image sources.
///
/// Implementations must re-query on every call; sources come and go between
/// calls and nothing may be cached beyond one operation.
pub trait ImageSource: Send + Sync {
    fn origin(&self) -> SourceOrigin;

    fn list(&self) -> Result<Vec<SourceInfo>, CaptureError>;

    /// Start delivering images from `name` until the registration is dropped.
    fn subscribe(&self, name: &str, delivery: ImageDelivery)
        -> Result<Registration, CaptureError>;

    fn contains(&self, name: &str) -> Result<bool, CaptureError> {
        Ok(self.list()?.iter().any(|info| info.name == name))
    }
}
