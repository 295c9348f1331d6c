use super::pipeline::LocalMediaPipeline;
use crate::engine::{IceCandidate, PeerSession, SdpType, SessionDescription};
use crate::errors::{EngineError, SessionError};
use crate::types::{DataBuffer, FlushStats, MediaConstraints, ServiceNames};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Which side creates the offer. Fixed when the session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Offerer,
    Answerer,
}

/// One live peer session.
pub struct Session {
    id: Uuid,
    peer_id: String,
    role: SessionRole,
    services: ServiceNames,
    constraints: MediaConstraints,
    created_at: DateTime<Utc>,
    peer: Arc<dyn PeerSession>,
    pipeline: Weak<LocalMediaPipeline>,
    ended: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        id: Uuid,
        peer_id: String,
        role: SessionRole,
        services: ServiceNames,
        constraints: MediaConstraints,
        peer: Arc<dyn PeerSession>,
        pipeline: &Arc<LocalMediaPipeline>,
    ) -> Self {
        Self {
            id,
            peer_id,
            role,
            services,
            constraints,
            created_at: Utc::now(),
            peer,
            pipeline: Arc::downgrade(pipeline),
            ended: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn services(&self) -> &ServiceNames {
        &self.services
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// The shared pipeline, while the orchestrator that built it is open.
    pub fn pipeline(&self) -> Option<Arc<LocalMediaPipeline>> {
        self.pipeline.upgrade()
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.is_ended() {
            Err(SessionError::Ended(self.peer_id.clone()))
        } else {
            Ok(())
        }
    }

    fn negotiation(&self, e: EngineError) -> SessionError {
        SessionError::Negotiation {
            peer_id: self.peer_id.clone(),
            reason: e.to_string(),
        }
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_live()?;
        if self.role != SessionRole::Offerer {
            return Err(SessionError::NotOfferer(self.peer_id.clone()));
        }
        log::info!("creating offer for peer '{}'", self.peer_id);
        self.peer
            .create_offer(&self.constraints)
            .await
            .map_err(|e| SessionError::Offer {
                peer_id: self.peer_id.clone(),
                reason: e.to_string(),
            })
    }

    /// Apply a remote description. An answering session replies to a remote
    /// offer with an answer, which is returned.
    pub async fn apply_remote_description(
        &self,
        sdp_type: &str,
        sdp: &str,
    ) -> Result<Option<SessionDescription>, SessionError> {
        self.ensure_live()?;
        let sdp_type: SdpType = sdp_type.parse().map_err(|e| self.negotiation(e))?;
        self.peer
            .set_remote_description(SessionDescription {
                sdp_type,
                sdp: sdp.to_string(),
            })
            .await
            .map_err(|e| self.negotiation(e))?;

        if self.role == SessionRole::Offerer || sdp_type != SdpType::Offer {
            return Ok(None);
        }
        log::info!("creating answer for peer '{}'", self.peer_id);
        let answer = self
            .peer
            .create_answer(&self.constraints)
            .await
            .map_err(|e| SessionError::Answer {
                peer_id: self.peer_id.clone(),
                reason: e.to_string(),
            })?;
        Ok(Some(answer))
    }

    pub async fn add_ice_candidate(
        &self,
        sdp_mid: &str,
        sdp_mline_index: u16,
        candidate: &str,
    ) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.peer
            .add_ice_candidate(IceCandidate {
                sdp_mid: sdp_mid.to_string(),
                sdp_mline_index,
                candidate: candidate.to_string(),
            })
            .await
            .map_err(|e| self.negotiation(e))
    }

    pub fn has_data_channel(&self, label: &str) -> bool {
        !self.is_ended() && self.peer.has_data_channel(label)
    }

    pub fn send_data(&self, label: &str, buffer: &DataBuffer) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.peer
            .send_data(label, buffer)
            .map_err(|e| self.negotiation(e))
    }

    pub fn flush(&self) -> FlushStats {
        self.peer.flush()
    }

    /// Close the engine side. Only the first call does anything.
    pub(crate) async fn finalize(&self) -> bool {
        if self.ended.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.peer.close().await;
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("ended", &self.is_ended())
            .finish()
    }
}
