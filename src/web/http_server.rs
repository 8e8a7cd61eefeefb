//! HTTP server for health checks and viewer signaling
//!
//! Serves the signaling WebSocket at `/ws`, a JSON health endpoint and,
//! when a web root is configured, the viewer's static files.

use crate::config::HttpConfig;
use crate::signaling::{Flow, Outbound, SignalingHub};
use crate::state::StreamState;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::services::ServeDir;

/// Per-connection outbound queue depth
const OUTBOUND_QUEUE: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SignalingHub>,
    pub stream: StreamState,
    pub lan_only: bool,
}

impl AppState {
    pub fn new(hub: Arc<SignalingHub>, stream: StreamState, lan_only: bool) -> Self {
        Self {
            hub,
            stream,
            lan_only,
        }
    }
}

/// Build the router for the given HTTP settings
pub fn router(config: &HttpConfig, app: AppState) -> Router {
    let router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler));

    let router = match &config.web_root {
        Some(root) => {
            info!("Serving viewer files from {:?}", root);
            router.fallback_service(ServeDir::new(root))
        }
        None => router,
    };

    router.with_state(app)
}

/// Run the HTTP server until the listener fails
pub async fn run_http_server(config: HttpConfig, app: AppState) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.host, config.port);
    let app = router(&config, app);

    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn health_handler(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": app.stream.start_time.elapsed().as_secs_f64(),
        "connections": app.hub.connections(),
        "peers": app.stream.peer_count(),
        "stream": app.stream.info(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(app): State<AppState>,
) -> Response {
    if app.lan_only && !is_lan_peer(peer.ip()) {
        warn!("Rejected signaling connection from {}: not a LAN address", peer);
        return (StatusCode::FORBIDDEN, "Access denied. Only IPv4 LAN allowed.").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, peer, app.hub))
}

/// Drive one signaling WebSocket until either side closes it
async fn handle_socket(socket: WebSocket, peer: SocketAddr, hub: Arc<SignalingHub>) {
    info!("Signaling connection from {}", peer);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);

    let send_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let msg = match out {
                Outbound::Text(text) => Message::Text(text.into()),
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut session = hub.open_session(peer.ip(), tx).await;

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if hub.handle_text(&mut session, text.as_str()).await == Flow::Close {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame from {}", peer);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Signaling connection {} failed: {}", peer, e);
                break;
            }
        }
    }

    hub.close_session(&session);
    drop(session);
    // Let a queued close frame go out before the writer is dropped
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), send_task).await;
    info!("Signaling connection from {} closed", peer);
}

/// Private IPv4 ranges plus loopback
pub fn is_lan_peer(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some_and(is_private_ipv4),
    }
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback()
}
