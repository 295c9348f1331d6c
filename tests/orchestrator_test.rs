//! Orchestrator integration tests
//!
//! Drives the bridge the way a remote signaling peer would: through the
//! control endpoints on a `LocalBus`, with the loopback engine standing in
//! for the real-time stack.

use crabrtc::bus::{
    BusMessage, ConnectRequest, ControlBus, ControlRequest, ControlResponse, DataMessage,
    ImageEncoding, LocalBus, Registration,
};
use crabrtc::config::VideoSourceSpec;
use crabrtc::engine::{IceConnectionState, LoopbackEngine, SdpType, VideoCapturer};
use crabrtc::errors::{OpenError, OpenStage, SessionError};
use crabrtc::orchestrator::{Orchestrator, SessionRole, ENDPOINTS};
use crabrtc::testing::{synthetic_audio, SyntheticCamera};
use crabrtc::types::{DataBuffer, DataChannelSpec, MediaConstraints, PixelFormat, ServiceNames};
use crabrtc::BridgeConfig;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CAMERA_TOPIC: &str = "camera/image_raw";
const SDP_CALLBACK: &str = "remote/sdp_offer_answer";
const ICE_CALLBACK: &str = "remote/ice_candidate";

struct Harness {
    bus: Arc<LocalBus>,
    engine: LoopbackEngine,
    orchestrator: Orchestrator,
    camera: Option<SyntheticCamera>,
}

impl Harness {
    fn new(config: BridgeConfig) -> Self {
        let bus = Arc::new(LocalBus::new());
        let camera = config
            .cameras
            .iter()
            .find(|c| c.name == CAMERA_TOPIC)
            .map(|_| SyntheticCamera::advertise(bus.clone(), CAMERA_TOPIC, 320, 240).unwrap());
        let engine = LoopbackEngine::new();
        let orchestrator = Orchestrator::new(config, bus.clone(), Arc::new(engine.clone()));
        Self {
            bus,
            engine,
            orchestrator,
            camera,
        }
    }

    async fn open(config: BridgeConfig) -> Self {
        let harness = Self::new(config);
        harness.orchestrator.open().await.expect("open should succeed");
        harness
    }

    async fn call(&self, endpoint: &str, request: ControlRequest) -> ControlResponse {
        self.bus
            .call(&self.orchestrator.endpoint_name(endpoint), request)
            .await
            .expect("endpoint should be registered")
    }

    async fn connect(&self, peer_id: &str) -> ControlResponse {
        let request = ConnectRequest::new(peer_id).with_data_channel(DataChannelSpec::new("chat"));
        self.call("connect", ControlRequest::Connect(request)).await
    }

    async fn disconnect(&self, peer_id: &str) -> ControlResponse {
        self.call(
            "disconnect",
            ControlRequest::Disconnect {
                peer_id: peer_id.to_string(),
            },
        )
        .await
    }

    async fn listed(&self) -> Vec<String> {
        match self.call("sessions", ControlRequest::Sessions).await {
            ControlResponse::Sessions { peer_ids } => peer_ids,
            other => panic!("unexpected sessions response: {:?}", other),
        }
    }
}

fn camera_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config
        .cameras
        .push(VideoSourceSpec::topic(CAMERA_TOPIC).with_publish(true));
    config
}

/// A remote callback endpoint that records every request it receives.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<ControlRequest>>>);

impl Recorder {
    fn advertise(&self, bus: &LocalBus, name: &str) -> Registration {
        let calls = self.0.clone();
        bus.advertise_service(
            name,
            Arc::new(move |request: ControlRequest| {
                calls.lock().unwrap().push(request);
                async { ControlResponse::Ok }.boxed()
            }),
        )
        .unwrap()
    }

    fn calls(&self) -> Vec<ControlRequest> {
        self.0.lock().unwrap().clone()
    }
}

async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn session_gone(orchestrator: &Orchestrator, peer_id: &str) -> bool {
    for _ in 0..300 {
        if orchestrator.session(peer_id).await.is_none() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_open_registers_endpoints_and_close_withdraws_them() {
    let h = Harness::open(BridgeConfig::default()).await;
    assert!(h.orchestrator.is_open());
    for endpoint in ENDPOINTS {
        assert!(h.bus.has_service(&format!("crabrtc/{}", endpoint)), "{} missing", endpoint);
    }
    assert_eq!(h.bus.subscriber_count("crabrtc/data_send"), 1);
    assert_eq!(h.engine.live_factories(), 1);

    h.orchestrator.close().await;
    assert!(!h.orchestrator.is_open());
    assert!(h.bus.service_names().is_empty());
    assert_eq!(h.bus.subscriber_count("crabrtc/data_send"), 0);
    assert_eq!(h.engine.live_factories(), 0);

    let after = h.bus.call("crabrtc/connect", ControlRequest::Sessions).await;
    assert!(after.is_err(), "endpoints must be gone after close");
}

#[tokio::test]
async fn test_open_twice_is_rejected() {
    let h = Harness::open(BridgeConfig::default()).await;
    let second = h.orchestrator.open().await;
    assert!(matches!(second, Err(OpenError::AlreadyOpen)));
    assert_eq!(h.engine.live_factories(), 1);
    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent_and_reopen_works() {
    let h = Harness::open(camera_config()).await;
    assert_eq!(h.connect("peer-a").await, ControlResponse::Ok);

    h.orchestrator.close().await;
    h.orchestrator.close().await;
    assert!(h.engine.session("peer-a").unwrap().is_closed());

    h.orchestrator.open().await.expect("reopen should succeed");
    assert!(h.listed().await.is_empty());
    assert_eq!(h.connect("peer-a").await, ControlResponse::Ok);
    assert_eq!(h.engine.live_factories(), 1);
    h.orchestrator.close().await;
    assert_eq!(h.engine.live_factories(), 0);
}

#[tokio::test]
async fn test_close_ends_sessions_and_releases_pipeline() {
    let h = Harness::open(camera_config()).await;
    let session = h
        .orchestrator
        .begin_session("peer-a", MediaConstraints::default(), vec![], ServiceNames::default())
        .await
        .unwrap();
    assert!(session.pipeline().is_some());

    h.orchestrator.close().await;
    assert!(session.is_ended());
    assert!(session.pipeline().is_none());
    assert!(h.orchestrator.sessions().await.is_empty());
}

#[tokio::test]
async fn test_factory_failure_unwinds_open() {
    let h = Harness::new(camera_config());
    h.engine.set_fail_factory(true);

    let err = h.orchestrator.open().await.unwrap_err();
    assert_eq!(err.stage(), Some(OpenStage::FactoryCreate));
    assert!(!h.orchestrator.is_open());
    assert_eq!(h.engine.live_factories(), 0);
    assert!(h.bus.service_names().is_empty());

    h.engine.set_fail_factory(false);
    h.orchestrator.open().await.expect("open after fixing the engine");
    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_missing_topic_fails_pipeline_stage() {
    let mut config = BridgeConfig::default();
    config.cameras.push(VideoSourceSpec::topic("nobody/publishes/this"));
    let h = Harness::new(config);

    let err = h.orchestrator.open().await.unwrap_err();
    assert_eq!(err.stage(), Some(OpenStage::PipelineBuild));
    assert_eq!(h.engine.live_factories(), 0);
    assert!(h.bus.service_names().is_empty());
}

#[tokio::test]
async fn test_unknown_device_fails_pipeline_stage() {
    let mut config = BridgeConfig::default();
    config.cameras.push(VideoSourceSpec::device("crabrtc-test-no-such-device"));
    let h = Harness::new(config);

    let err = h.orchestrator.open().await.unwrap_err();
    assert_eq!(err.stage(), Some(OpenStage::PipelineBuild));
    assert!(!h.orchestrator.is_open());
}

#[tokio::test]
async fn test_operations_before_open() {
    let h = Harness::new(BridgeConfig::default());
    let result = h
        .orchestrator
        .begin_session("peer-a", MediaConstraints::default(), vec![], ServiceNames::default())
        .await;
    assert!(matches!(result, Err(SessionError::NotOpen)));
    assert!(!h.orchestrator.end_session("peer-a").await);
    assert_eq!(h.orchestrator.dispatch_data("chat", b"x", false).await, 0);
    assert_eq!(h.orchestrator.flush().await.reaped_data_messages, 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// SESSIONS
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_connect_list_duplicate_disconnect() {
    let h = Harness::open(camera_config()).await;

    assert_eq!(h.connect("peer-b").await, ControlResponse::Ok);
    assert_eq!(h.connect("peer-a").await, ControlResponse::Ok);
    assert_eq!(h.listed().await, vec!["peer-a", "peer-b"]);

    let duplicate = h.connect("peer-a").await;
    assert!(!duplicate.is_success(), "second connect for a peer must fail");
    assert_eq!(h.engine.sessions_created(), 2);

    assert_eq!(h.disconnect("peer-a").await, ControlResponse::Ok);
    assert!(!h.disconnect("peer-a").await.is_success());
    assert!(h.engine.session("peer-a").unwrap().is_closed());
    assert_eq!(h.listed().await, vec!["peer-b"]);

    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_concurrent_connects_for_one_peer() {
    let h = Harness::open(BridgeConfig::default()).await;

    let (a, b) = tokio::join!(h.connect("peer-a"), h.connect("peer-a"));
    let successes = [a, b].iter().filter(|r| r.is_success()).count();
    assert_eq!(successes, 1);
    assert_eq!(h.listed().await, vec!["peer-a"]);

    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_end_session_happens_once() {
    let h = Harness::open(BridgeConfig::default()).await;
    let session = h
        .orchestrator
        .begin_session("peer-a", MediaConstraints::default(), vec![], ServiceNames::default())
        .await
        .unwrap();
    assert_eq!(session.role(), SessionRole::Offerer);

    assert!(h.orchestrator.end_session("peer-a").await);
    assert!(!h.orchestrator.end_session("peer-a").await);
    assert!(session.is_ended());
    assert!(matches!(
        session.create_offer().await,
        Err(SessionError::Ended(_))
    ));

    h.orchestrator.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_racing_ice_disconnect_ends_session_once() {
    let h = Harness::open(BridgeConfig::default()).await;

    for round in 0..50 {
        assert_eq!(h.connect("peer-a").await, ControlResponse::Ok);
        let remote = h.engine.session("peer-a").unwrap();

        let transport = remote.clone();
        let drop_link = tokio::task::spawn_blocking(move || {
            transport.set_ice_connection_state(IceConnectionState::Disconnected);
        });
        let (_, dropped) = tokio::join!(h.disconnect("peer-a"), drop_link);
        dropped.unwrap();

        assert!(session_gone(&h.orchestrator, "peer-a").await, "round {}", round);
        assert!(eventually(|| remote.close_calls() > 0).await, "round {}", round);
        // whichever path lost the race finds nothing left to end
        assert!(!h.orchestrator.end_session("peer-a").await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(remote.is_closed());
        assert_eq!(remote.close_calls(), 1, "round {}", round);
    }

    h.orchestrator.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_begin_session_racing_close_leaves_nothing_behind() {
    let h = Harness::open(BridgeConfig::default()).await;

    for round in 0..50 {
        let begin = h.orchestrator.begin_session(
            "peer-a",
            MediaConstraints::default(),
            vec![],
            ServiceNames::default(),
        );
        let (begun, ()) = tokio::join!(begin, h.orchestrator.close());
        if let Err(e) = begun {
            assert!(matches!(e, SessionError::NotOpen), "round {}: {}", round, e);
        }
        assert!(h.orchestrator.sessions().await.is_empty(), "round {}", round);

        h.orchestrator.open().await.unwrap();
        assert!(
            h.orchestrator
                .begin_session("peer-a", MediaConstraints::default(), vec![], ServiceNames::default())
                .await
                .is_ok(),
            "round {}",
            round
        );
        assert!(h.orchestrator.end_session("peer-a").await);
    }

    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_offer_failure_rolls_back() {
    let h = Harness::open(BridgeConfig::default()).await;
    h.engine.fail_offer("peer-bad");

    let response = h.connect("peer-bad").await;
    assert!(!response.is_success());
    assert!(h.listed().await.is_empty());
    assert!(h.engine.session("peer-bad").unwrap().is_closed());

    assert_eq!(h.connect("peer-good").await, ControlResponse::Ok);
    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_session_init_failure_leaves_no_session() {
    let h = Harness::open(BridgeConfig::default()).await;
    h.engine.fail_session_init("peer-x");

    let ControlResponse::Failed { reason } = h.connect("peer-x").await else {
        panic!("connect should fail");
    };
    assert!(reason.contains("peer-x"));
    assert!(h.listed().await.is_empty());
    assert!(h.engine.session("peer-x").is_none());

    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_disconnect_event_ends_session() {
    let h = Harness::open(BridgeConfig::default()).await;
    assert_eq!(h.connect("peer-a").await, ControlResponse::Ok);

    let remote = h.engine.session("peer-a").unwrap();
    remote.set_ice_connection_state(IceConnectionState::Connected);
    remote.set_ice_connection_state(IceConnectionState::Disconnected);

    assert!(session_gone(&h.orchestrator, "peer-a").await);
    assert!(remote.is_closed());
    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_stale_disconnect_event_is_ignored() {
    let h = Harness::open(BridgeConfig::default()).await;
    assert_eq!(h.connect("peer-a").await, ControlResponse::Ok);
    let old = h.engine.session("peer-a").unwrap();

    assert_eq!(h.disconnect("peer-a").await, ControlResponse::Ok);
    assert_eq!(h.connect("peer-a").await, ControlResponse::Ok);
    let current = h.engine.session("peer-a").unwrap();
    assert!(!Arc::ptr_eq(&old, &current));

    old.set_ice_connection_state(IceConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.listed().await, vec!["peer-a"]);
    assert!(!current.is_closed());
    h.orchestrator.close().await;
}

// ═══════════════════════════════════════════════════════════════════════════
// SIGNALING
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_local_description_and_candidate_reach_callbacks() {
    let h = Harness::open(camera_config()).await;
    let recorder = Recorder::default();
    let _sdp = recorder.advertise(&h.bus, SDP_CALLBACK);
    let _ice = recorder.advertise(&h.bus, ICE_CALLBACK);

    let request = ConnectRequest::new("peer-a").with_callbacks("", ICE_CALLBACK, SDP_CALLBACK);
    assert_eq!(
        h.call("connect", ControlRequest::Connect(request)).await,
        ControlResponse::Ok
    );

    assert!(eventually(|| recorder.calls().len() >= 2).await);
    let calls = recorder.calls();
    let offer = calls
        .iter()
        .find_map(|c| match c {
            ControlRequest::SdpOfferAnswer { peer_id, sdp_type, sdp } => {
                Some((peer_id.clone(), sdp_type.clone(), sdp.clone()))
            }
            _ => None,
        })
        .expect("offer callback");
    assert_eq!(offer.0, "peer-a");
    assert_eq!(offer.1, "offer");
    assert!(offer.2.starts_with("v=0"));
    assert!(offer.2.contains("m=video"));
    assert!(calls
        .iter()
        .any(|c| matches!(c, ControlRequest::IceCandidate { peer_id, .. } if peer_id == "peer-a")));

    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_missing_callbacks_are_tolerated() {
    let h = Harness::open(BridgeConfig::default()).await;
    let request =
        ConnectRequest::new("peer-a").with_callbacks("", "remote/not_there", "remote/not_either");
    assert_eq!(
        h.call("connect", ControlRequest::Connect(request)).await,
        ControlResponse::Ok
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.listed().await, vec!["peer-a"]);
    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_remote_answer_and_candidates() {
    let h = Harness::open(BridgeConfig::default()).await;
    assert_eq!(h.connect("peer-a").await, ControlResponse::Ok);

    let candidate = ControlRequest::IceCandidate {
        peer_id: "peer-a".to_string(),
        sdp_mid: "0".to_string(),
        sdp_mline_index: 0,
        candidate: "candidate:9 1 udp 1 10.0.0.2 5000 typ host".to_string(),
    };
    // no remote description yet
    assert!(!h.call("ice_candidate", candidate.clone()).await.is_success());

    let answer = ControlRequest::SdpOfferAnswer {
        peer_id: "peer-a".to_string(),
        sdp_type: "answer".to_string(),
        sdp: "v=0\r\ns=-\r\n".to_string(),
    };
    assert_eq!(h.call("sdp_offer_answer", answer).await, ControlResponse::Ok);
    assert_eq!(h.call("ice_candidate", candidate).await, ControlResponse::Ok);

    let remote = h.engine.session("peer-a").unwrap();
    assert_eq!(remote.remote_description().unwrap().sdp_type, SdpType::Answer);
    assert_eq!(remote.remote_candidates().len(), 1);

    let bogus = ControlRequest::SdpOfferAnswer {
        peer_id: "peer-a".to_string(),
        sdp_type: "bogus".to_string(),
        sdp: "v=0\r\n".to_string(),
    };
    assert!(!h.call("sdp_offer_answer", bogus).await.is_success());

    let unknown = ControlRequest::SdpOfferAnswer {
        peer_id: "peer-z".to_string(),
        sdp_type: "answer".to_string(),
        sdp: "v=0\r\n".to_string(),
    };
    assert!(!h.call("sdp_offer_answer", unknown).await.is_success());

    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_request_on_wrong_endpoint_fails() {
    let h = Harness::open(BridgeConfig::default()).await;
    let response = h.call("disconnect", ControlRequest::Sessions).await;
    assert!(!response.is_success());
    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_answering_session() {
    let h = Harness::open(BridgeConfig::default()).await;
    let recorder = Recorder::default();
    let _sdp = recorder.advertise(&h.bus, SDP_CALLBACK);

    let services = ServiceNames {
        sdp_offer_answer: SDP_CALLBACK.to_string(),
        ..ServiceNames::default()
    };
    let session = h
        .orchestrator
        .begin_session_as(
            SessionRole::Answerer,
            "peer-a",
            MediaConstraints::default(),
            vec![],
            services,
        )
        .await
        .unwrap();
    assert!(matches!(
        session.create_offer().await,
        Err(SessionError::NotOfferer(_))
    ));

    let offer = ControlRequest::SdpOfferAnswer {
        peer_id: "peer-a".to_string(),
        sdp_type: "offer".to_string(),
        sdp: "v=0\r\ns=remote\r\n".to_string(),
    };
    assert_eq!(h.call("sdp_offer_answer", offer).await, ControlResponse::Ok);

    assert!(
        eventually(|| recorder.calls().iter().any(|c| matches!(
            c,
            ControlRequest::SdpOfferAnswer { sdp_type, .. } if sdp_type == "answer"
        )))
        .await
    );
    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_offerer_does_not_answer_remote_offer() {
    let mut config = BridgeConfig::default();
    config.session_constraints =
        MediaConstraints::default().with_optional("DtlsSrtpKeyAgreement", "true");
    let h = Harness::open(config).await;

    let answer = h
        .orchestrator
        .begin_session_as(
            SessionRole::Offerer,
            "peer-a",
            MediaConstraints::default().with_mandatory("OfferToReceiveVideo", "false"),
            vec![],
            ServiceNames::default(),
        )
        .await
        .unwrap()
        .apply_remote_description("offer", "v=0\r\n")
        .await
        .unwrap();
    assert!(answer.is_none());
    h.orchestrator.close().await;
}

// ═══════════════════════════════════════════════════════════════════════════
// DATA CHANNELS
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_dispatch_and_flush() {
    let h = Harness::open(BridgeConfig::default()).await;
    assert_eq!(h.connect("peer-a").await, ControlResponse::Ok);
    assert_eq!(h.connect("peer-b").await, ControlResponse::Ok);
    assert_eq!(
        h.call(
            "connect",
            ControlRequest::Connect(ConnectRequest::new("peer-c"))
        )
        .await,
        ControlResponse::Ok
    );

    assert_eq!(h.orchestrator.dispatch_data("chat", b"hello", false).await, 2);
    assert_eq!(h.orchestrator.dispatch_data("telemetry", b"hello", false).await, 0);

    h.engine
        .session("peer-b")
        .unwrap()
        .set_ice_connection_state(IceConnectionState::Failed);
    assert_eq!(h.orchestrator.dispatch_data("chat", &[1, 2, 3], true).await, 2);

    let stats = h.orchestrator.flush().await;
    assert_eq!(stats.reaped_data_messages, 3);
    assert_eq!(stats.dropped_data_messages, 1);
    assert_eq!(h.orchestrator.flush().await.reaped_data_messages, 0);

    let sent = h.engine.session("peer-a").unwrap().sent("chat");
    assert_eq!(sent.len(), 2);
    assert!(!sent[0].binary);
    assert!(sent[1].binary);

    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_data_send_topic_fans_out() {
    let h = Harness::open(BridgeConfig::default()).await;
    assert_eq!(h.connect("peer-a").await, ControlResponse::Ok);

    let reached = h
        .bus
        .publish(
            "crabrtc/data_send",
            BusMessage::Data(DataMessage::binary("chat", vec![7u8, 7, 7])),
        )
        .unwrap();
    assert_eq!(reached, 1);

    let remote = h.engine.session("peer-a").unwrap();
    assert!(eventually(|| remote.sent("chat").len() == 1).await);
    assert_eq!(remote.sent("chat")[0], DataBuffer::new(vec![7u8, 7, 7], true));

    h.orchestrator.close().await;
}

#[tokio::test]
async fn test_received_data_is_published() {
    let h = Harness::open(BridgeConfig::default()).await;
    assert_eq!(h.connect("peer-a").await, ControlResponse::Ok);

    let received: Arc<Mutex<Vec<DataMessage>>> = Arc::default();
    let sink = received.clone();
    let _sub = h
        .bus
        .subscribe(
            "crabrtc/data_recv",
            Arc::new(move |msg: &BusMessage| {
                if let BusMessage::Data(data) = msg {
                    sink.lock().unwrap().push(data.clone());
                }
            }),
        )
        .unwrap();

    let remote = h.engine.session("peer-a").unwrap();
    remote
        .receive_data("chat", DataBuffer::new(b"pong".to_vec(), false))
        .unwrap();
    assert!(remote.receive_data("telemetry", DataBuffer::new(vec![1u8], true)).is_err());

    assert!(eventually(|| !received.lock().unwrap().is_empty()).await);
    let message = received.lock().unwrap()[0].clone();
    assert_eq!(message.label, "chat");
    assert_eq!(&message.buffer[..], b"pong");
    assert!(!message.is_binary());

    h.orchestrator.close().await;
}

// ═══════════════════════════════════════════════════════════════════════════
// MEDIA
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_camera_frames_reach_engine_and_republish() {
    let mut h = Harness::open(camera_config()).await;

    let republished: Arc<Mutex<Vec<(u32, u32, ImageEncoding)>>> = Arc::default();
    let sink = republished.clone();
    let _sub = h
        .bus
        .subscribe(
            "crabrtc/local/video_v1",
            Arc::new(move |msg: &BusMessage| {
                if let BusMessage::Image(img) = msg {
                    sink.lock().unwrap().push((img.width, img.height, img.encoding));
                }
            }),
        )
        .unwrap();

    let pipeline = h.orchestrator.pipeline().unwrap();
    assert_eq!(pipeline.video_labels(), vec!["v1"]);
    let bridge = pipeline.bridge("v1").unwrap();
    assert!(bridge.capture_started());

    let mut camera = h.camera.take().unwrap();
    let engine = h.engine.clone();
    for _ in 0..300 {
        camera.publish_next().unwrap();
        if engine.video_frames("v1") > 0 && !republished.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(engine.video_frames("v1") > 0);
    assert_eq!(republished.lock().unwrap()[0], (320, 240, ImageEncoding::I420));

    let settings = bridge.capture_settings();
    assert_eq!((settings.width, settings.height), (320, 240));
    assert_eq!(settings.format, PixelFormat::I420);

    drop(pipeline);
    h.orchestrator.close().await;
    assert!(!bridge.capture_started());
}

#[tokio::test]
async fn test_audio_is_republished_when_enabled() {
    let mut config = BridgeConfig::default();
    config.microphone.publish = true;
    let h = Harness::open(config).await;

    let count = Arc::new(Mutex::new(0usize));
    let sink = count.clone();
    let _sub = h
        .bus
        .subscribe(
            "crabrtc/local/audio_a1",
            Arc::new(move |msg: &BusMessage| {
                if let BusMessage::Audio(audio) = msg {
                    assert_eq!(audio.track_id, "a1");
                    *sink.lock().unwrap() += audio.samples.len();
                }
            }),
        )
        .unwrap();

    assert_eq!(h.engine.feed_audio(&synthetic_audio(0, 480), 0), 1);
    assert_eq!(*count.lock().unwrap(), 480);

    h.orchestrator.close().await;
    assert_eq!(h.engine.feed_audio(&synthetic_audio(1, 480), 0), 0);
}
