use anyhow::{bail, Context, Result};
use crabrtc::bus::{BusMessage, ConnectRequest, ControlRequest, ControlResponse, DataMessage};
use crabrtc::capture::registry::declared_capabilities;
use crabrtc::config::VideoSourceSpec;
use crabrtc::testing::SyntheticCamera;
use crabrtc::types::{DataChannelSpec, SourceOrigin};
use crabrtc::{BridgeConfig, ControlBus, LocalBus, LoopbackEngine, Orchestrator};
use futures::FutureExt;
use std::env;
use std::sync::Arc;
use std::time::Duration;

const DEMO_TOPIC: &str = "demo/image_raw";
const DEMO_PEER: &str = "demo-peer";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: crabrtc-cli <check-config|catalog|demo> [args]");
        std::process::exit(1);
    }

    let command = &args[1];
    match command.as_str() {
        "check-config" => cmd_check_config(&args),
        "catalog" => cmd_catalog(&args),
        "demo" => cmd_demo(&args).await,
        _ => {
            eprintln!("Unknown command: {}", command);
            std::process::exit(1);
        }
    }
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn positional(args: &[String]) -> Option<&str> {
    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--kind" | "--frames" => i += 2,
            a if a.starts_with("--") => i += 1,
            a => return Some(a),
        }
    }
    None
}

fn cmd_check_config(args: &[String]) -> Result<()> {
    crabrtc::init_logging();
    let Some(path) = positional(args) else {
        eprintln!("Usage: crabrtc-cli check-config <path> [--json]");
        std::process::exit(1);
    };

    let config = BridgeConfig::load_from_file(path)
        .with_context(|| format!("loading {}", path))?;
    config.validate().context("validating configuration")?;
    let trace = config.trace_level();

    if has_flag(args, "--json") {
        let out = serde_json::json!({
            "config": config,
            "trace_mask": trace.0,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("namespace:       {}", config.namespace);
        println!("flush frequency: {}s", config.flush_frequency);
        println!("trace mask:      {:#06x} ({})", trace.0, trace.level_filter());
        for camera in &config.cameras {
            let label = if camera.label.is_empty() { "-" } else { &camera.label };
            println!(
                "camera:          {} label={} publish={}",
                camera.qualified_name(),
                label,
                camera.publish
            );
        }
        println!(
            "microphone:      label={} publish={}",
            config.microphone.label, config.microphone.publish
        );
        for server in &config.ice_servers {
            println!("ice server:      {}", server.uri);
        }
    }
    Ok(())
}

fn cmd_catalog(args: &[String]) -> Result<()> {
    let origin = match flag_value(args, "--kind").unwrap_or("topic") {
        "topic" => SourceOrigin::Topic,
        "device" | "sys" => SourceOrigin::Device,
        other => bail!("unknown source kind '{}', expected topic or device", other),
    };

    let catalog = declared_capabilities(origin);
    if has_flag(args, "--json") {
        println!("{}", serde_json::to_string(&*catalog)?);
    } else {
        for cap in catalog.iter() {
            println!("{}x{} {} @{}fps", cap.width, cap.height, cap.format, cap.max_fps);
        }
    }
    Ok(())
}

async fn cmd_demo(args: &[String]) -> Result<()> {
    crabrtc::init_logging();
    let config = match positional(args) {
        Some(path) => BridgeConfig::load_from_file(path).with_context(|| format!("loading {}", path))?,
        None => {
            let mut config = BridgeConfig::default();
            config.cameras.push(VideoSourceSpec::topic(DEMO_TOPIC).with_publish(true));
            config
        }
    };
    config.validate()?;
    let frames: u64 = flag_value(args, "--frames").unwrap_or("30").parse()?;
    let hold = has_flag(args, "--hold");

    let bus = Arc::new(LocalBus::new());
    let mut cameras = Vec::new();
    for camera in &config.cameras {
        if camera.origin == SourceOrigin::Topic {
            cameras.push(SyntheticCamera::advertise(bus.clone(), &camera.name, 320, 240)?);
        }
    }

    let engine = LoopbackEngine::new();
    let orchestrator = Orchestrator::new(config, bus.clone(), Arc::new(engine.clone()));
    orchestrator.open().await?;

    let sdp_service = format!("{}/sdp_offer_answer", DEMO_PEER);
    let ice_service = format!("{}/ice_candidate", DEMO_PEER);
    let _sdp = bus.advertise_service(
        &sdp_service,
        Arc::new(|req: ControlRequest| {
            async move {
                if let ControlRequest::SdpOfferAnswer { sdp_type, sdp, .. } = &req {
                    println!("<- {} ({} bytes)", sdp_type, sdp.len());
                }
                ControlResponse::Ok
            }
            .boxed()
        }),
    )?;
    let _ice = bus.advertise_service(
        &ice_service,
        Arc::new(|req: ControlRequest| {
            async move {
                if let ControlRequest::IceCandidate { candidate, .. } = &req {
                    println!("<- candidate {}", candidate);
                }
                ControlResponse::Ok
            }
            .boxed()
        }),
    )?;

    let connect = ConnectRequest::new(DEMO_PEER)
        .with_data_channel(DataChannelSpec::new("chat"))
        .with_callbacks("", ice_service.as_str(), sdp_service.as_str());
    let response = bus
        .call(&orchestrator.endpoint_name("connect"), ControlRequest::Connect(connect))
        .await?;
    println!("connect: {:?}", response);

    let response = bus
        .call(&orchestrator.endpoint_name("sessions"), ControlRequest::Sessions)
        .await?;
    println!("sessions: {:?}", response);

    for _ in 0..frames {
        for camera in cameras.iter_mut() {
            camera.publish_next()?;
        }
        tokio::time::sleep(Duration::from_millis(33)).await;
    }

    bus.publish(
        &orchestrator.endpoint_name("data_send"),
        BusMessage::Data(DataMessage::text("chat", "hello from crabrtc")),
    )?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    if hold {
        println!("holding, press Ctrl-C to stop");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        ctrlc::set_handler(move || {
            let _ = tx.send(());
        })?;
        let mut ticker = tokio::time::interval(Duration::from_millis(33));
        loop {
            tokio::select! {
                _ = rx.recv() => break,
                _ = ticker.tick() => {
                    for camera in cameras.iter_mut() {
                        camera.publish_next()?;
                    }
                }
            }
        }
    }

    let stats = orchestrator.flush().await;
    println!(
        "flush: {} reaped, {} dropped",
        stats.reaped_data_messages, stats.dropped_data_messages
    );
    if let Some(pipeline) = orchestrator.pipeline() {
        for label in pipeline.video_labels() {
            println!("track {}: {} frame(s)", label, engine.video_frames(&label));
        }
    }

    let response = bus
        .call(
            &orchestrator.endpoint_name("disconnect"),
            ControlRequest::Disconnect {
                peer_id: DEMO_PEER.to_string(),
            },
        )
        .await?;
    println!("disconnect: {:?}", response);

    orchestrator.close().await;
    Ok(())
}
