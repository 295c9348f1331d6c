//! Control-plane request handlers and the session event pump.
//!
//! Handlers hold only a weak reference to the orchestrator and run on the
//! signaling context. Every error becomes a failed response; nothing
//! escapes a handler.

use super::observer::{EventReceiver, ObservedEvent, SessionEvent};
use super::{Inner, Orchestrator, SessionRole};
use crate::bus::{
    BusMessage, ConnectRequest, ControlRequest, ControlResponse, ServiceHandler, TopicHandler,
};
use crate::engine::ContextHandle;
use crate::errors::SessionError;
use futures::FutureExt;
use std::sync::{Arc, Weak};

pub(super) fn service_handler(
    weak: Weak<Inner>,
    signaling: ContextHandle,
    endpoint: &'static str,
) -> ServiceHandler {
    Arc::new(move |request: ControlRequest| {
        let weak = weak.clone();
        let signaling = signaling.clone();
        async move {
            let Some(inner) = weak.upgrade() else {
                return ControlResponse::failed("orchestrator is closed");
            };
            let orchestrator = Orchestrator::from_inner(inner);
            match signaling
                .run(async move { handle(&orchestrator, endpoint, request).await })
                .await
            {
                Ok(response) => response,
                Err(e) => ControlResponse::failed(e),
            }
        }
        .boxed()
    })
}

/// Inbound `data_send` traffic. Fan-out runs on the signaling context; the
/// publisher is never blocked on sessions.
pub(super) fn data_handler(weak: Weak<Inner>, signaling: ContextHandle) -> TopicHandler {
    Arc::new(move |message: &BusMessage| {
        let BusMessage::Data(data) = message else {
            log::debug!("ignoring {} message on data topic", message.kind());
            return;
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let orchestrator = Orchestrator::from_inner(inner);
        let data = data.clone();
        signaling.spawn(async move {
            orchestrator
                .dispatch_data(&data.label, &data.buffer, data.is_binary())
                .await;
        });
    })
}

/// Serve one control request.
pub async fn handle(
    orchestrator: &Orchestrator,
    endpoint: &str,
    request: ControlRequest,
) -> ControlResponse {
    if request.endpoint() != endpoint {
        return ControlResponse::failed(format!(
            "'{}' request sent to '{}'",
            request.endpoint(),
            endpoint
        ));
    }
    match request.peer_id() {
        Some(peer_id) => log::info!("serve '{}' for peer '{}'", endpoint, peer_id),
        None => log::info!("serve '{}'", endpoint),
    }

    let result = match request {
        ControlRequest::Connect(connect) => handle_connect(orchestrator, connect).await,
        ControlRequest::Disconnect { peer_id } => {
            if orchestrator.end_session(&peer_id).await {
                Ok(ControlResponse::Ok)
            } else {
                Err(SessionError::UnknownPeer(peer_id))
            }
        }
        ControlRequest::IceCandidate {
            peer_id,
            sdp_mid,
            sdp_mline_index,
            candidate,
        } => match orchestrator.session(&peer_id).await {
            Some(session) => session
                .add_ice_candidate(&sdp_mid, sdp_mline_index, &candidate)
                .await
                .map(|()| ControlResponse::Ok),
            None => Err(SessionError::UnknownPeer(peer_id)),
        },
        ControlRequest::SdpOfferAnswer {
            peer_id,
            sdp_type,
            sdp,
        } => match orchestrator.session(&peer_id).await {
            Some(session) => session
                .apply_remote_description(&sdp_type, &sdp)
                .await
                .map(|_| ControlResponse::Ok),
            None => Err(SessionError::UnknownPeer(peer_id)),
        },
        ControlRequest::Sessions => Ok(ControlResponse::Sessions {
            peer_ids: orchestrator.sessions().await,
        }),
    };

    result.unwrap_or_else(|e| {
        log::warn!("'{}' failed: {}", endpoint, e);
        ControlResponse::failed(e)
    })
}

async fn handle_connect(
    orchestrator: &Orchestrator,
    connect: ConnectRequest,
) -> Result<ControlResponse, SessionError> {
    let services = connect.service_names();
    let session = orchestrator
        .begin_session_as(
            SessionRole::Offerer,
            &connect.peer_id,
            connect.sdp_constraints,
            connect.data_channels,
            services,
        )
        .await?;

    if let Err(e) = session.create_offer().await {
        log::warn!("rolling back session for peer '{}'", connect.peer_id);
        orchestrator.end_session_if(&connect.peer_id, session.id()).await;
        return Err(e);
    }
    Ok(ControlResponse::Ok)
}

/// Drain session events until the channel closes or the orchestrator goes away.
pub(super) async fn pump_events(weak: Weak<Inner>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        handle_event(&Orchestrator::from_inner(inner), event).await;
    }
    log::debug!("session event pump finished");
}

async fn handle_event(orchestrator: &Orchestrator, observed: ObservedEvent) {
    let ObservedEvent {
        peer_id,
        session_id,
        event,
    } = observed;

    let event = match event {
        SessionEvent::Disconnected => {
            if orchestrator.end_session_if(&peer_id, session_id).await {
                log::info!("peer '{}' disconnected", peer_id);
            } else {
                log::debug!("ignoring stale disconnect for peer '{}'", peer_id);
            }
            return;
        }
        SessionEvent::DataReceived { label, buffer } => {
            orchestrator.publish_received(&label, buffer);
            return;
        }
        other => other,
    };

    let session = match orchestrator.session(&peer_id).await {
        Some(session) if session.id() == session_id => session,
        _ => {
            log::debug!("dropping event for ended session of peer '{}'", peer_id);
            return;
        }
    };
    let services = session.services();

    let (service, request) = match event {
        SessionEvent::LocalDescription(desc) => (
            &services.sdp_offer_answer,
            ControlRequest::SdpOfferAnswer {
                peer_id: peer_id.clone(),
                sdp_type: desc.sdp_type.to_string(),
                sdp: desc.sdp,
            },
        ),
        SessionEvent::LocalIceCandidate(candidate) => (
            &services.ice_candidate,
            ControlRequest::IceCandidate {
                peer_id: peer_id.clone(),
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                candidate: candidate.candidate,
            },
        ),
        SessionEvent::Disconnected | SessionEvent::DataReceived { .. } => return,
    };

    if service.is_empty() {
        log::debug!("peer '{}' has no '{}' callback", peer_id, request.endpoint());
        return;
    }
    match orchestrator.inner.bus.call(service, request).await {
        Ok(response) if response.is_success() => {}
        Ok(response) => log::warn!("callback '{}' for peer '{}' failed: {:?}", service, peer_id, response),
        Err(e) => log::warn!("callback '{}' for peer '{}' failed: {}", service, peer_id, e),
    }
}
