//! Session orchestration
//!
//! [`Orchestrator`] owns the engine's execution contexts, the connection
//! factory, the shared [`LocalMediaPipeline`] and the live session set. It
//! serves the control endpoints on the bus and fans inbound data out to
//! sessions.
//!
//! Lifecycle:
//! - `open()` runs four stages (context start, factory creation, pipeline
//!   build, endpoint registration). A failing stage unwinds everything the
//!   earlier stages allocated.
//! - `close()` unregisters endpoints first, then ends sessions, releases the
//!   pipeline and the factory, and stops the execution contexts last.
//!
//! The session set is guarded by an async `RwLock`. `begin_session` holds the
//! write lock while the engine creates the session, so concurrent connects
//! for one peer id can never both succeed. Removal happens under the same
//! lock, so whichever of an explicit disconnect and a disconnect event gets
//! there first ends the session and the other finds nothing.

pub mod handlers;
pub mod observer;
pub mod pipeline;
pub mod session;

pub use observer::{ObservedEvent, SessionEvent, SessionObserver};
pub use pipeline::{LocalMediaPipeline, PipelineSources, DEFAULT_AUDIO_LABEL, STREAM_LABEL};
pub use session::{Session, SessionRole};

use crate::bus::{qualify, BusMessage, ControlBus, DataMessage, Registration, DATA_KIND};
use crate::capture::{ImageSource, TopicImageSource};
use crate::config::BridgeConfig;
use crate::engine::{
    ConnectionFactory, ContextHandle, EngineConfig, EngineContexts, ExecutionContext, RtcEngine,
};
use crate::errors::{OpenError, SessionError};
use crate::types::{DataBuffer, DataChannelSpec, FlushStats, MediaConstraints, ServiceNames};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const WORKER_CONTEXT: &str = "worker_thread";
pub const SIGNALING_CONTEXT: &str = "signaling_thread";

/// Control endpoints served under the namespace.
pub const ENDPOINTS: [&str; 5] = [
    "connect",
    "disconnect",
    "ice_candidate",
    "sdp_offer_answer",
    "sessions",
];
pub const DATA_SEND_TOPIC: &str = "data_send";
pub const DATA_RECV_TOPIC: &str = "data_recv";

/// Handles that exist only while open, shared with in-flight operations.
struct Live {
    factory: Arc<dyn ConnectionFactory>,
    pipeline: Arc<LocalMediaPipeline>,
    events: UnboundedSender<ObservedEvent>,
}

/// Everything `open()` allocated, in the order `close()` releases it.
#[derive(Default)]
struct OpenResources {
    registrations: Vec<Registration>,
    flush_task: Option<JoinHandle<()>>,
    pump_task: Option<JoinHandle<()>>,
    pipeline: Option<Arc<LocalMediaPipeline>>,
    factory: Option<Arc<dyn ConnectionFactory>>,
    signaling: Option<ExecutionContext>,
    worker: Option<ExecutionContext>,
}

struct Inner {
    config: BridgeConfig,
    bus: Arc<dyn ControlBus>,
    engine: Arc<dyn RtcEngine>,
    device_source: Option<Arc<dyn ImageSource>>,
    resources: Mutex<Option<OpenResources>>,
    live: StdRwLock<Option<Arc<Live>>>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: BridgeConfig, bus: Arc<dyn ControlBus>, engine: Arc<dyn RtcEngine>) -> Self {
        Self::build(config, bus, engine, default_device_source())
    }

    /// Use `source` for process-local (`sys://`) cameras.
    pub fn with_device_source(
        config: BridgeConfig,
        bus: Arc<dyn ControlBus>,
        engine: Arc<dyn RtcEngine>,
        source: Arc<dyn ImageSource>,
    ) -> Self {
        Self::build(config, bus, engine, Some(source))
    }

    fn build(
        config: BridgeConfig,
        bus: Arc<dyn ControlBus>,
        engine: Arc<dyn RtcEngine>,
        device_source: Option<Arc<dyn ImageSource>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                bus,
                engine,
                device_source,
                resources: Mutex::new(None),
                live: StdRwLock::new(None),
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn namespace(&self) -> &str {
        &self.inner.config.namespace
    }

    /// Fully qualified name of an endpoint or topic.
    pub fn endpoint_name(&self, name: &str) -> String {
        qualify(&self.inner.config.namespace, name)
    }

    pub fn is_open(&self) -> bool {
        self.live().is_some()
    }

    pub fn pipeline(&self) -> Option<Arc<LocalMediaPipeline>> {
        self.live().map(|live| live.pipeline.clone())
    }

    fn live(&self) -> Option<Arc<Live>> {
        self.inner
            .live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_live(&self, live: Option<Arc<Live>>) {
        *self.inner.live.write().unwrap_or_else(PoisonError::into_inner) = live;
    }

    pub async fn open(&self) -> Result<(), OpenError> {
        let mut resources = self.inner.resources.lock().await;
        if resources.is_some() {
            return Err(OpenError::AlreadyOpen);
        }

        log::info!("opening orchestrator '{}'", self.namespace());
        let mut res = OpenResources::default();
        match self.open_stages(&mut res).await {
            Ok(()) => {
                *resources = Some(res);
                log::info!("orchestrator '{}' open", self.namespace());
                Ok(())
            }
            Err(e) => {
                log::error!("failed to open orchestrator '{}': {}", self.namespace(), e);
                self.teardown(res).await;
                Err(e)
            }
        }
    }

    async fn open_stages(&self, res: &mut OpenResources) -> Result<(), OpenError> {
        let config = &self.inner.config;

        let worker = start_context(WORKER_CONTEXT)?;
        let worker_handle = worker.handle();
        res.worker = Some(worker);
        let signaling = start_context(SIGNALING_CONTEXT)?;
        let signaling_handle = signaling.handle();
        res.signaling = Some(signaling);

        let contexts = EngineContexts {
            worker: worker_handle.clone(),
            signaling: signaling_handle.clone(),
        };
        let engine_config = EngineConfig {
            trace_level: config.trace_level(),
            ice_servers: config.ice_servers.clone(),
        };
        let factory = self
            .inner
            .engine
            .create_factory(&contexts, &engine_config)
            .map_err(|e| OpenError::FactoryCreate(e.to_string()))?;
        res.factory = Some(factory.clone());
        log::debug!("created '{}' connection factory", self.inner.engine.name());

        let topics = TopicImageSource::new(self.inner.bus.clone());
        let pipeline = Arc::new(LocalMediaPipeline::build(
            config,
            factory.as_ref(),
            &self.inner.bus,
            PipelineSources {
                topics: &topics,
                devices: self.inner.device_source.as_deref(),
            },
        )?);
        res.pipeline = Some(pipeline.clone());

        let (events, rx) = unbounded_channel();
        res.pump_task = Some(signaling_handle.spawn(handlers::pump_events(self.downgrade(), rx)));
        self.set_live(Some(Arc::new(Live {
            factory,
            pipeline,
            events,
        })));

        self.register_endpoints(res, &signaling_handle)?;

        if let Some(period) = config.flush_interval() {
            let weak = self.downgrade();
            res.flush_task = Some(worker_handle.spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    let stats = Orchestrator::from_inner(inner).flush().await;
                    log::info!(
                        "flush: {} data message(s) reaped, {} dropped",
                        stats.reaped_data_messages,
                        stats.dropped_data_messages
                    );
                }
            }));
        }
        Ok(())
    }

    fn register_endpoints(
        &self,
        res: &mut OpenResources,
        signaling: &ContextHandle,
    ) -> Result<(), OpenError> {
        let bus = &self.inner.bus;
        let register_err = |name: &str, e: crate::errors::BusError| OpenError::EndpointRegister {
            name: name.to_string(),
            reason: e.to_string(),
        };

        for endpoint in ENDPOINTS {
            let name = self.endpoint_name(endpoint);
            let handler = handlers::service_handler(self.downgrade(), signaling.clone(), endpoint);
            let registration = bus
                .advertise_service(&name, handler)
                .map_err(|e| register_err(&name, e))?;
            res.registrations.push(registration);
            log::debug!("serving '{}'", name);
        }

        let recv = self.endpoint_name(DATA_RECV_TOPIC);
        let registration = bus
            .advertise_topic(&recv, DATA_KIND)
            .map_err(|e| register_err(&recv, e))?;
        res.registrations.push(registration);

        let send = self.endpoint_name(DATA_SEND_TOPIC);
        let registration = bus
            .subscribe(&send, handlers::data_handler(self.downgrade(), signaling.clone()))
            .map_err(|e| register_err(&send, e))?;
        res.registrations.push(registration);
        Ok(())
    }

    /// Close the orchestrator. Closing a closed orchestrator does nothing.
    pub async fn close(&self) {
        let mut resources = self.inner.resources.lock().await;
        let Some(res) = resources.take() else {
            return;
        };
        log::info!("closing orchestrator '{}'", self.namespace());
        self.teardown(res).await;
        log::info!("orchestrator '{}' closed", self.namespace());
    }

    /// Release whatever `res` holds. Safe on partially opened resources.
    async fn teardown(&self, mut res: OpenResources) {
        res.registrations.clear();
        if let Some(task) = res.flush_task.take() {
            task.abort();
        }
        let live = self.inner.live.write().unwrap_or_else(PoisonError::into_inner).take();

        let sessions: Vec<Arc<Session>> = self.inner.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            if session.finalize().await {
                log::info!("ended session for peer '{}'", session.peer_id());
            }
        }

        if let Some(task) = res.pump_task.take() {
            task.abort();
        }
        drop(live);

        if let Some(pipeline) = res.pipeline.take() {
            let released = tokio::task::spawn_blocking(move || pipeline.release()).await;
            match released {
                Ok(Ok(())) => log::debug!("local pipeline released"),
                Ok(Err(e)) => log::error!("local pipeline released uncleanly: {}", e),
                Err(e) => log::error!("failed to release local pipeline: {}", e),
            }
        }

        res.factory.take();

        if let Some(mut signaling) = res.signaling.take() {
            signaling.stop().await;
        }
        if let Some(mut worker) = res.worker.take() {
            worker.stop().await;
        }
    }

    /// Create a session for `peer_id` that will make the offer.
    pub async fn begin_session(
        &self,
        peer_id: &str,
        sdp_constraints: MediaConstraints,
        data_channels: Vec<DataChannelSpec>,
        services: ServiceNames,
    ) -> Result<Arc<Session>, SessionError> {
        self.begin_session_as(SessionRole::Offerer, peer_id, sdp_constraints, data_channels, services)
            .await
    }

    pub async fn begin_session_as(
        &self,
        role: SessionRole,
        peer_id: &str,
        sdp_constraints: MediaConstraints,
        data_channels: Vec<DataChannelSpec>,
        services: ServiceNames,
    ) -> Result<Arc<Session>, SessionError> {
        let live = self.live().ok_or(SessionError::NotOpen)?;

        let mut sessions = self.inner.sessions.write().await;
        // close may have drained the set while this call waited for it
        if !self.live().is_some_and(|current| Arc::ptr_eq(&current, &live)) {
            return Err(SessionError::NotOpen);
        }
        if sessions.contains_key(peer_id) {
            return Err(SessionError::DuplicatePeer(peer_id.to_string()));
        }

        let mut constraints = self.inner.config.session_constraints.clone();
        constraints.mandatory.extend(sdp_constraints.mandatory);
        constraints.optional.extend(sdp_constraints.optional);

        let id = Uuid::new_v4();
        let init = crate::engine::SessionInit {
            peer_id: peer_id.to_string(),
            stream_label: live.pipeline.stream_label().to_string(),
            tracks: live.pipeline.tracks(),
            constraints: constraints.clone(),
            data_channels,
            ice_servers: self.inner.config.ice_servers.clone(),
            observer: SessionObserver::new(peer_id, id, live.events.clone()),
        };
        let peer = live
            .factory
            .create_session(init)
            .await
            .map_err(|e| SessionError::Init {
                peer_id: peer_id.to_string(),
                reason: e.to_string(),
            })?;

        let session = Arc::new(Session::new(
            id,
            peer_id.to_string(),
            role,
            services,
            constraints,
            peer,
            &live.pipeline,
        ));
        sessions.insert(peer_id.to_string(), session.clone());
        log::info!("began session {} for peer '{}' as {:?}", id, peer_id, role);
        Ok(session)
    }

    /// End the session for `peer_id`. Returns whether one existed.
    pub async fn end_session(&self, peer_id: &str) -> bool {
        let removed = self.inner.sessions.write().await.remove(peer_id);
        self.finish(removed).await
    }

    /// End the session for `peer_id` only if it is still `session_id`.
    pub async fn end_session_if(&self, peer_id: &str, session_id: Uuid) -> bool {
        let removed = {
            let mut sessions = self.inner.sessions.write().await;
            match sessions.get(peer_id) {
                Some(s) if s.id() == session_id => sessions.remove(peer_id),
                _ => None,
            }
        };
        self.finish(removed).await
    }

    async fn finish(&self, removed: Option<Arc<Session>>) -> bool {
        match removed {
            Some(session) => {
                session.finalize().await;
                log::info!("ended session for peer '{}'", session.peer_id());
                true
            }
            None => false,
        }
    }

    pub async fn session(&self, peer_id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().await.get(peer_id).cloned()
    }

    /// Peer ids of the live sessions, sorted.
    pub async fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.read().await.values().cloned().collect()
    }

    /// Sum of every live session's flush result.
    pub async fn flush(&self) -> FlushStats {
        self.snapshot().await.iter().map(|s| s.flush()).sum()
    }

    /// Send `payload` to every session with a channel named `label`.
    /// Returns how many sessions it reached.
    pub async fn dispatch_data(&self, label: &str, payload: &[u8], is_binary: bool) -> usize {
        let buffer = DataBuffer::new(payload.to_vec(), is_binary);
        let mut reached = 0;
        for session in self.snapshot().await {
            if !session.has_data_channel(label) {
                continue;
            }
            match session.send_data(label, &buffer) {
                Ok(()) => reached += 1,
                Err(e) => log::warn!("failed to send on '{}' to '{}': {}", label, session.peer_id(), e),
            }
        }
        log::debug!("dispatched '{}' to {} session(s)", label, reached);
        reached
    }

    fn publish_received(&self, label: &str, buffer: DataBuffer) {
        let message = DataMessage {
            label: label.to_string(),
            buffer: buffer.data,
            encoding: if buffer.binary { "binary" } else { "utf-8" }.to_string(),
        };
        let topic = self.endpoint_name(DATA_RECV_TOPIC);
        if let Err(e) = self.inner.bus.publish(&topic, BusMessage::Data(message)) {
            log::warn!("failed to publish received data on '{}': {}", topic, e);
        }
    }
}

fn start_context(name: &str) -> Result<ExecutionContext, OpenError> {
    ExecutionContext::start(name).map_err(|e| OpenError::ContextStart {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(feature = "native-device")]
fn default_device_source() -> Option<Arc<dyn ImageSource>> {
    Some(Arc::new(crate::capture::NativeDeviceSource::new()))
}

#[cfg(not(feature = "native-device"))]
fn default_device_source() -> Option<Arc<dyn ImageSource>> {
    None
}
