//! castbridge - Main entry point
//!
//! Wires the agent receiver, the WebRTC sink and the signaling server, or runs
//! the relay viewer with `castbridge view`.

mod args;

use args::{Args, Command};
use castbridge::web::{run_http_server, AppState};
use castbridge::{
    Config, PeerConnectionManager, Receiver, ReceiverEvent, SessionEvent, SignalingHub, StreamState,
    ViewerClient, WebRtcMediaSink,
};
use clap::Parser;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = args.load_config();
    let mut config = match &loaded {
        Ok(cfg) => cfg.clone(),
        Err(_) => Config::default(),
    };
    args.apply_overrides(&mut config);

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose { "debug" } else { config.logging.level.as_str() };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("CASTBRIDGE_LOG").unwrap_or_else(|_| log_level.to_string()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("castbridge v{}", env!("CARGO_PKG_VERSION"));
    match loaded {
        Ok(_) => info!("Loaded configuration from {:?}", args.config),
        Err(e) => warn!("Failed to load config: {}, using defaults", e),
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    match args.command {
        Some(Command::View { .. }) => run_viewer(config).await,
        _ => run_bridge(config).await,
    }
}

async fn run_bridge(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let state = StreamState::new(&config);
    let (session_tx, session_rx) = mpsc::unbounded_channel();
    let (receiver_tx, receiver_rx) = mpsc::unbounded_channel();

    let manager = PeerConnectionManager::new(config.webrtc.clone());
    let sink = Arc::new(WebRtcMediaSink::new(
        manager,
        config.audio.enabled,
        state.clone(),
        session_tx.clone(),
    ));

    let hub = SignalingHub::new(&config.auth, sink.clone(), state.clone(), session_tx);
    let receiver = Receiver::new(config.receiver.clone(), state.clone(), sink, receiver_tx);

    let agent_addr = format!("{}:{}", config.receiver.host, config.receiver.port);
    let listener = TcpListener::bind(&agent_addr).await?;
    let mut receiver_task = tokio::spawn(receiver.run(listener));

    let app = AppState::new(hub.clone(), state.clone(), config.http.lan_only);
    let mut http_task = tokio::spawn(run_http_server(config.http.clone(), app));

    let events_task = tokio::spawn(drain_events(session_rx, receiver_rx, state));

    info!("Bridge running; press Ctrl+C to stop");
    tokio::select! {
        _ = signal::ctrl_c() => info!("Shutdown signal received"),
        result = &mut receiver_task => match result {
            Ok(Err(e)) => error!("Agent listener failed: {}", e),
            Ok(Ok(())) => {}
            Err(e) => error!("Agent listener task panicked: {}", e),
        },
        result = &mut http_task => match result {
            Ok(Err(e)) => error!("HTTP server failed: {}", e),
            Ok(Ok(())) => {}
            Err(e) => error!("HTTP server task panicked: {}", e),
        },
    }

    receiver_task.abort();
    http_task.abort();
    events_task.abort();
    hub.shutdown();
    info!("Bridge stopped");
    Ok(())
}

/// Log the events the bridge exposes to an embedding application
async fn drain_events(
    mut sessions: mpsc::UnboundedReceiver<SessionEvent>,
    mut receiver: mpsc::UnboundedReceiver<ReceiverEvent>,
    state: StreamState,
) {
    // Held so the agent's control socket stays open
    let mut control = None;
    loop {
        tokio::select! {
            Some(event) = sessions.recv() => match event {
                SessionEvent::Control(payload) => debug!("Viewer control: {}", payload),
                SessionEvent::ConnectAdb(address) => info!("Viewer requested adb connect to {}", address),
                SessionEvent::LoginInit { max_size } => debug!("Viewer login, maxSize {:?}", max_size),
                SessionEvent::PeerStateChanged { count, connected } => {
                    info!("Viewer {} ({} connected)", if connected { "joined" } else { "left" }, count)
                }
            },
            Some(event) = receiver.recv() => match event {
                ReceiverEvent::ControlChannel { peer, stream } => {
                    info!("Agent control channel from {} ready", peer);
                    control = Some(stream);
                }
                ReceiverEvent::DeviceName(name) => {
                    info!("Agent device {} (adb: {})", name, state.info().adb_connected)
                }
            },
            else => break,
        }
    }
    drop(control);
}

async fn run_viewer(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let output = TcpStream::connect(&config.viewer.output).await?;
    info!("Writing relayed stream to {}", config.viewer.output);

    let client = ViewerClient::new(config.viewer.clone(), config.auth.password.clone(), config.webrtc.clone());
    tokio::select! {
        result = client.run(output) => result?,
        _ = signal::ctrl_c() => info!("Shutdown signal received"),
    }
    Ok(())
}
