use super::{ImageDelivery, ImageSource, SourceInfo};
use crate::bus::{BusMessage, ControlBus, Registration, IMAGE_DATA_KIND};
use crate::errors::CaptureError;
use crate::types::SourceOrigin;
use std::sync::Arc;

/// Image topics published on the control bus by other processes.
#[derive(Clone)]
pub struct TopicImageSource {
    bus: Arc<dyn ControlBus>,
}

impl TopicImageSource {
    pub fn new(bus: Arc<dyn ControlBus>) -> Self {
        Self { bus }
    }
}

impl ImageSource for TopicImageSource {
    fn origin(&self) -> SourceOrigin {
        SourceOrigin::Topic
    }

    fn list(&self) -> Result<Vec<SourceInfo>, CaptureError> {
        let topics = self
            .bus
            .topics()
            .map_err(|e| CaptureError::Registry(e.to_string()))?;
        Ok(topics
            .into_iter()
            .filter(|t| t.kind == IMAGE_DATA_KIND)
            .map(|t| SourceInfo {
                name: t.name,
                kind: t.kind,
            })
            .collect())
    }

    fn subscribe(
        &self,
        name: &str,
        delivery: ImageDelivery,
    ) -> Result<Registration, CaptureError> {
        let topic = name.to_string();
        self.bus
            .subscribe(
                name,
                Arc::new(move |msg: &BusMessage| match msg {
                    BusMessage::Image(image) => delivery(image.clone()),
                    other => log::debug!("ignoring {} message on image topic '{}'", other.kind(), topic),
                }),
            )
            .map_err(|e| CaptureError::Subscribe {
                source_name: name.to_string(),
                reason: e.to_string(),
            })
    }
}
