//! CrabRTC: expose a local audio/video pipeline as many real-time peer sessions
//!
//! One local pipeline (an audio track plus any number of video tracks) is
//! shared by every connected peer. Peers are created, negotiated and torn
//! down through control endpoints on a message bus, and data-channel
//! traffic is fanned out to every session that negotiated the channel.
//!
//! # Features
//! - Session orchestration with strict one-session-per-peer semantics
//! - Threaded capture bridge turning push-delivered images into a
//!   pull-based capturer, with I420 conversion
//! - Declared capability catalogs per source kind
//! - Lenient TOML configuration and named trace filters
//! - Pluggable real-time engine; an in-process loopback engine is included
//!
//! # Usage
//! ```rust,no_run
//! use crabrtc::{BridgeConfig, LocalBus, LoopbackEngine, Orchestrator};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::new(
//!     BridgeConfig::default(),
//!     Arc::new(LocalBus::new()),
//!     Arc::new(LoopbackEngine::new()),
//! );
//! orchestrator.open().await?;
//! // ... serve "crabrtc/connect" and friends ...
//! orchestrator.close().await;
//! # Ok(())
//! # }
//! ```
pub mod bus;
pub mod capture;
pub mod config;
pub mod engine;
pub mod errors;
pub mod orchestrator;
pub mod testing;
pub mod timing;
pub mod trace;
pub mod types;

// Re-exports for convenience
pub use bus::{ControlBus, ControlRequest, ControlResponse, LocalBus};
pub use capture::{CapabilityCatalog, CaptureBridge, CaptureSourceRegistry, TopicImageSource};
pub use config::BridgeConfig;
pub use engine::{LoopbackEngine, RtcEngine};
pub use errors::{BusError, CaptureError, ConfigError, EngineError, OpenError, SessionError};
pub use orchestrator::{Orchestrator, Session, SessionRole};
pub use trace::TraceLevel;
pub use types::{Capability, FlushStats, PixelFormat};

/// Initialize logging
///
/// `RUST_LOG` wins when set; otherwise only our own info-level output is shown.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(format!("{}=info", NAME)),
    )
    .try_init();
}

/// Initialize logging with the default level derived from a trace mask.
pub fn init_logging_with(level: TraceLevel) {
    let filter = format!("{}={}", NAME, level.level_filter()).to_lowercase();
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}
