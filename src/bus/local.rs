use super::{
    BusMessage, ControlBus, ControlRequest, ControlResponse, Registration, ServiceHandler,
    TopicHandler, TopicInfo,
};
use crate::errors::BusError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

#[derive(Default)]
struct TopicEntry {
    kind: Option<String>,
    publishers: usize,
    subscribers: Vec<(u64, TopicHandler)>,
}

#[derive(Default)]
struct BusInner {
    services: RwLock<HashMap<String, ServiceHandler>>,
    topics: RwLock<HashMap<String, TopicEntry>>,
    next_id: AtomicU64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// In-process [`ControlBus`].
///
/// Topic handlers run synchronously on the publishing thread, outside any
/// bus lock, so a handler may itself publish or subscribe.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_service(&self, name: &str) -> bool {
        read(&self.inner.services).contains_key(name)
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.inner.services).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        read(&self.inner.topics)
            .get(topic)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    fn release_topic(inner: &Weak<BusInner>, name: &str, subscriber: Option<u64>) {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut topics = write(&inner.topics);
        let Some(entry) = topics.get_mut(name) else {
            return;
        };
        match subscriber {
            Some(id) => entry.subscribers.retain(|(sid, _)| *sid != id),
            None => {
                entry.publishers = entry.publishers.saturating_sub(1);
                if entry.publishers == 0 {
                    entry.kind = None;
                }
            }
        }
        if entry.publishers == 0 && entry.subscribers.is_empty() {
            topics.remove(name);
        }
    }
}

impl ControlBus for LocalBus {
    fn advertise_service(
        &self,
        name: &str,
        handler: ServiceHandler,
    ) -> Result<Registration, BusError> {
        let mut services = write(&self.inner.services);
        if services.contains_key(name) {
            return Err(BusError::AlreadyRegistered(name.to_string()));
        }
        services.insert(name.to_string(), handler);
        log::debug!("advertised service '{}'", name);

        let weak = Arc::downgrade(&self.inner);
        let key = name.to_string();
        Ok(Registration::new(name, move || {
            if let Some(inner) = weak.upgrade() {
                write(&inner.services).remove(&key);
                log::debug!("withdrew service '{}'", key);
            }
        }))
    }

    fn call(
        &self,
        name: &str,
        request: ControlRequest,
    ) -> BoxFuture<'static, Result<ControlResponse, BusError>> {
        let handler = read(&self.inner.services).get(name).cloned();
        match handler {
            Some(handler) => handler(request).map(Ok).boxed(),
            None => {
                let err = BusError::NoEndpoint(name.to_string());
                async move { Err(err) }.boxed()
            }
        }
    }

    fn advertise_topic(&self, name: &str, kind: &str) -> Result<Registration, BusError> {
        {
            let mut topics = write(&self.inner.topics);
            let entry = topics.entry(name.to_string()).or_default();
            if let Some(existing) = &entry.kind {
                if existing != kind {
                    return Err(BusError::KindMismatch(name.to_string(), existing.clone()));
                }
            }
            entry.kind = Some(kind.to_string());
            entry.publishers += 1;
        }

        let weak = Arc::downgrade(&self.inner);
        let key = name.to_string();
        Ok(Registration::new(name, move || {
            LocalBus::release_topic(&weak, &key, None)
        }))
    }

    fn subscribe(&self, topic: &str, handler: TopicHandler) -> Result<Registration, BusError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        write(&self.inner.topics)
            .entry(topic.to_string())
            .or_default()
            .subscribers
            .push((id, handler));

        let weak = Arc::downgrade(&self.inner);
        let key = topic.to_string();
        Ok(Registration::new(topic, move || {
            LocalBus::release_topic(&weak, &key, Some(id))
        }))
    }

    fn publish(&self, topic: &str, message: BusMessage) -> Result<usize, BusError> {
        let handlers: Vec<TopicHandler> = {
            let topics = read(&self.inner.topics);
            let Some(entry) = topics.get(topic) else {
                return Ok(0);
            };
            if let Some(kind) = &entry.kind {
                if kind != message.kind() {
                    return Err(BusError::KindMismatch(topic.to_string(), kind.clone()));
                }
            }
            entry.subscribers.iter().map(|(_, h)| h.clone()).collect()
        };

        for handler in &handlers {
            handler(&message);
        }
        Ok(handlers.len())
    }

    fn topics(&self) -> Result<Vec<TopicInfo>, BusError> {
        let mut topics: Vec<TopicInfo> = read(&self.inner.topics)
            .iter()
            .filter(|(_, entry)| entry.publishers > 0)
            .filter_map(|(name, entry)| {
                entry.kind.as_ref().map(|kind| TopicInfo {
                    name: name.clone(),
                    kind: kind.clone(),
                })
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DataMessage, IMAGE_DATA_KIND};
    use std::sync::atomic::AtomicUsize;

    fn ok_handler() -> ServiceHandler {
        Arc::new(|_req| async { ControlResponse::Ok }.boxed())
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let bus = LocalBus::new();
        let reg = bus.advertise_service("ns/connect", ok_handler()).unwrap();
        assert!(bus.has_service("ns/connect"));
        assert!(matches!(
            bus.advertise_service("ns/connect", ok_handler()),
            Err(BusError::AlreadyRegistered(_))
        ));

        let resp = bus.call("ns/connect", ControlRequest::Sessions).await.unwrap();
        assert_eq!(resp, ControlResponse::Ok);

        drop(reg);
        assert!(!bus.has_service("ns/connect"));
        assert!(matches!(
            bus.call("ns/connect", ControlRequest::Sessions).await,
            Err(BusError::NoEndpoint(_))
        ));
    }

    #[test]
    fn test_topic_listing_follows_publishers() {
        let bus = LocalBus::new();
        assert!(bus.topics().unwrap().is_empty());

        let b = bus.advertise_topic("b/image", IMAGE_DATA_KIND).unwrap();
        let a = bus.advertise_topic("a/image", IMAGE_DATA_KIND).unwrap();
        let names: Vec<String> = bus.topics().unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a/image", "b/image"]);

        drop(a);
        let names: Vec<String> = bus.topics().unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["b/image"]);
        drop(b);
        assert!(bus.topics().unwrap().is_empty());
    }

    #[test]
    fn test_publish_reaches_subscribers_until_dropped() {
        let bus = LocalBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = bus
            .subscribe(
                "ns/data_send",
                Arc::new(move |_msg| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let msg = BusMessage::Data(DataMessage::text("chat", "hi"));
        assert_eq!(bus.publish("ns/data_send", msg.clone()).unwrap(), 1);
        drop(sub);
        assert_eq!(bus.publish("ns/data_send", msg).unwrap(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count("ns/data_send"), 0);
    }

    #[test]
    fn test_kind_mismatch() {
        let bus = LocalBus::new();
        let _reg = bus.advertise_topic("cam", IMAGE_DATA_KIND).unwrap();
        assert!(matches!(
            bus.advertise_topic("cam", "other"),
            Err(BusError::KindMismatch(_, _))
        ));
        let _sub = bus.subscribe("cam", Arc::new(|_| {})).unwrap();
        assert!(bus
            .publish("cam", BusMessage::Data(DataMessage::text("x", "y")))
            .is_err());
    }
}
