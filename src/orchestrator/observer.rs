use crate::engine::{IceCandidate, IceConnectionState, SessionDescription};
use crate::types::DataBuffer;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Something a session reported, tagged with the session it came from.
#[derive(Debug, Clone)]
pub struct ObservedEvent {
    pub peer_id: String,
    pub session_id: Uuid,
    pub event: SessionEvent,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Disconnected,
    LocalDescription(SessionDescription),
    LocalIceCandidate(IceCandidate),
    DataReceived { label: String, buffer: DataBuffer },
}

pub type EventReceiver = UnboundedReceiver<ObservedEvent>;

/// Engine-facing end of a session's event channel.
///
/// Sends never block and never re-enter the orchestrator; events are drained
/// by the orchestrator's pump task. A send after the orchestrator closed is
/// dropped.
#[derive(Debug, Clone)]
pub struct SessionObserver {
    peer_id: String,
    session_id: Uuid,
    tx: UnboundedSender<ObservedEvent>,
}

impl SessionObserver {
    pub fn new(peer_id: impl Into<String>, session_id: Uuid, tx: UnboundedSender<ObservedEvent>) -> Self {
        Self {
            peer_id: peer_id.into(),
            session_id,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn on_ice_connection_change(&self, state: IceConnectionState) {
        log::debug!("peer '{}' ice connection state {:?}", self.peer_id, state);
        if state == IceConnectionState::Disconnected {
            self.send(SessionEvent::Disconnected);
        }
    }

    pub fn on_local_description(&self, desc: SessionDescription) {
        self.send(SessionEvent::LocalDescription(desc));
    }

    pub fn on_ice_candidate(&self, candidate: IceCandidate) {
        self.send(SessionEvent::LocalIceCandidate(candidate));
    }

    pub fn on_data(&self, label: &str, buffer: DataBuffer) {
        self.send(SessionEvent::DataReceived {
            label: label.to_string(),
            buffer,
        });
    }

    fn send(&self, event: SessionEvent) {
        let observed = ObservedEvent {
            peer_id: self.peer_id.clone(),
            session_id: self.session_id,
            event,
        };
        if self.tx.send(observed).is_err() {
            log::debug!("dropping event for peer '{}', orchestrator closed", self.peer_id);
        }
    }
}
