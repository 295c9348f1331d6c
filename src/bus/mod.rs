//! Host control plane
//!
//! The bridge is driven through named request/response endpoints and
//! publish/subscribe topics. [`ControlBus`] is the seam to whatever message
//! system hosts the bridge; [`LocalBus`] is an in-process implementation.

pub mod local;
pub mod messages;

pub use local::LocalBus;
pub use messages::{
    AudioMessage, BusMessage, ConnectRequest, ControlRequest, ControlResponse, DataMessage,
    ImageEncoding, ImageMessage, AUDIO_DATA_KIND, DATA_KIND, IMAGE_DATA_KIND,
};

use crate::errors::BusError;
use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

pub type ServiceFuture = BoxFuture<'static, ControlResponse>;
/// Serves one request endpoint.
pub type ServiceHandler = Arc<dyn Fn(ControlRequest) -> ServiceFuture + Send + Sync>;
/// Receives topic traffic, on the publisher's thread.
pub type TopicHandler = Arc<dyn Fn(&BusMessage) + Send + Sync>;

/// A published topic and the kind of data it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicInfo {
    pub name: String,
    pub kind: String,
}

pub trait ControlBus: Send + Sync {
    /// Serve `name` with `handler` until the returned registration is dropped.
    fn advertise_service(&self, name: &str, handler: ServiceHandler)
        -> Result<Registration, BusError>;

    fn call(
        &self,
        name: &str,
        request: ControlRequest,
    ) -> BoxFuture<'static, Result<ControlResponse, BusError>>;

    /// Declare that we publish `kind` data on `name`.
    fn advertise_topic(&self, name: &str, kind: &str) -> Result<Registration, BusError>;

    fn subscribe(&self, topic: &str, handler: TopicHandler) -> Result<Registration, BusError>;

    /// Deliver `message` to current subscribers. Returns how many received it.
    fn publish(&self, topic: &str, message: BusMessage) -> Result<usize, BusError>;

    /// Topics that currently have at least one publisher.
    fn topics(&self) -> Result<Vec<TopicInfo>, BusError>;
}

/// Keeps an endpoint, topic advertisement or subscription alive.
/// Dropping it withdraws the registration.
pub struct Registration {
    name: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Registration {
    pub fn new(name: impl Into<String>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unregister(self) {
        drop(self)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("name", &self.name).finish()
    }
}

/// `"{namespace}/{name}"`
pub fn qualify(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}
