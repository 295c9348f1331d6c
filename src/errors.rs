use thiserror::Error;

/// Configuration problems that make a whole document unusable.
///
/// Individual malformed fields never surface here; they are logged and left
/// at their defaults by the loader.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("failed to serialize config: {0}")]
    Serialize(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Stage of [`Orchestrator::open`](crate::orchestrator::Orchestrator::open) that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum OpenStage {
    ContextStart,
    FactoryCreate,
    PipelineBuild,
    EndpointRegister,
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("orchestrator is already open")]
    AlreadyOpen,
    #[error("failed to start execution context '{name}': {reason}")]
    ContextStart { name: String, reason: String },
    #[error("failed to create connection factory: {0}")]
    FactoryCreate(String),
    #[error("failed to build local media pipeline: {0}")]
    PipelineBuild(String),
    #[error("failed to register endpoint '{name}': {reason}")]
    EndpointRegister { name: String, reason: String },
}

impl OpenError {
    /// The stage that failed, `None` for [`OpenError::AlreadyOpen`].
    pub fn stage(&self) -> Option<OpenStage> {
        match self {
            OpenError::AlreadyOpen => None,
            OpenError::ContextStart { .. } => Some(OpenStage::ContextStart),
            OpenError::FactoryCreate(_) => Some(OpenStage::FactoryCreate),
            OpenError::PipelineBuild(_) => Some(OpenStage::PipelineBuild),
            OpenError::EndpointRegister { .. } => Some(OpenStage::EndpointRegister),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("orchestrator is not open")]
    NotOpen,
    #[error("session for peer '{0}' already exists")]
    DuplicatePeer(String),
    #[error("no session for peer '{0}'")]
    UnknownPeer(String),
    #[error("session for peer '{peer_id}' failed to initialize: {reason}")]
    Init { peer_id: String, reason: String },
    #[error("failed to create offer for peer '{peer_id}': {reason}")]
    Offer { peer_id: String, reason: String },
    #[error("failed to create answer for peer '{peer_id}': {reason}")]
    Answer { peer_id: String, reason: String },
    #[error("negotiation failed for peer '{peer_id}': {reason}")]
    Negotiation { peer_id: String, reason: String },
    #[error("session for peer '{0}' is not the offer initiator")]
    NotOfferer(String),
    #[error("session for peer '{0}' has ended")]
    Ended(String),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no image source named '{0}'")]
    SourceNotFound(String),
    #[error("source registry query failed: {0}")]
    Registry(String),
    #[error("failed to subscribe to '{source_name}': {reason}")]
    Subscribe { source_name: String, reason: String },
    #[error("failed to spawn capture thread: {0}")]
    ThreadSpawn(String),
    /// The polling thread could not be joined. The thread is leaked; this is
    /// not a recoverable condition.
    #[error("capture thread for '{0}' could not be joined, leaking it")]
    ThreadJoin(String),
    #[error("unsupported image encoding '{0}'")]
    UnsupportedEncoding(String),
    #[error("malformed image: {0}")]
    MalformedImage(String),
}

/// Failures reported by the real-time engine behind the session seam.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine rejected request: {0}")]
    Rejected(String),
    #[error("execution context stopped: {0}")]
    ContextStopped(String),
    #[error("data channel '{0}' not found")]
    ChannelNotFound(String),
    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("endpoint '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("no endpoint named '{0}'")]
    NoEndpoint(String),
    #[error("topic '{0}' is advertised with data kind '{1}'")]
    KindMismatch(String, String),
    #[error("bus is shut down")]
    Shutdown,
}
