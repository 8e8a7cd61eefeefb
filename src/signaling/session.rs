//! Per-connection signaling state machine
//!
//! ```text
//! Connected --initConfig--> Unauthenticated --loginAuth ok--> Authenticated
//!                                  |  ^
//!                                  +--+ failed login (socket stays open)
//! ```
//!
//! While unauthenticated every message other than `loginAuth` is ignored.
//! The only case that closes the socket from this side is an IP lockout.

use super::auth::{self, AuthPolicy, Authenticator, LoginOutcome};
use super::broadcaster::{ConnectionBroadcaster, Outbound, SessionHandle};
use super::message::{
    Ack, AuthResult, ClientMessage, Embedded, InfoNotify, InitConfig, LoginRequest, OfferResult,
    ServerMessage,
};
use super::{SessionEvent, SignalingError};
use crate::config::AuthConfig;
use crate::media::MediaSink;
use crate::state::{StreamEvent, StreamState};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// What the connection loop should do after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// State owned by one connection's read loop
#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    security_key: String,
    authenticated: bool,
}

impl Session {
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn security_key(&self) -> &str {
        &self.security_key
    }
}

/// Shared signaling component: login policy, connection registry and the
/// bridge to the media sink
pub struct SignalingHub {
    authenticator: Authenticator,
    broadcaster: ConnectionBroadcaster,
    sink: Arc<dyn MediaSink>,
    state: StreamState,
    events: mpsc::UnboundedSender<SessionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingHub {
    pub fn new(
        auth_config: &AuthConfig,
        sink: Arc<dyn MediaSink>,
        state: StreamState,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let authenticator = Authenticator::new(AuthPolicy::from(auth_config));
        let tasks = authenticator.spawn_sweepers();
        let hub = Arc::new(Self {
            authenticator,
            broadcaster: ConnectionBroadcaster::new(),
            sink,
            state,
            events,
            tasks: Mutex::new(tasks),
        });
        let forwarder = hub.spawn_info_forwarder();
        hub.tasks.lock().push(forwarder);
        hub
    }

    pub fn connections(&self) -> usize {
        self.broadcaster.len()
    }

    /// Register a new connection and send it its challenge
    pub async fn open_session(&self, remote_ip: IpAddr, tx: mpsc::Sender<Outbound>) -> Session {
        let handle = SessionHandle::new(remote_ip, tx);
        self.broadcaster.add(handle.clone());
        let session = Session {
            handle,
            security_key: auth::generate_security_key(),
            authenticated: false,
        };

        let init = ServerMessage::InitConfig(InitConfig {
            os: std::env::consts::OS.to_string(),
            security_key: session.security_key.clone(),
        });
        if let Err(e) = session.handle.send(&init).await {
            debug!("Could not send initConfig to {}: {}", remote_ip, e);
        }
        info!(
            "Signaling connection {} from {} ({} open)",
            session.handle.id(),
            remote_ip,
            self.connections()
        );
        session
    }

    pub fn close_session(&self, session: &Session) {
        self.broadcaster.remove(&session.handle.id());
        info!(
            "Signaling connection {} closed ({} open)",
            session.handle.id(),
            self.connections()
        );
    }

    /// Handle one text frame from the viewer
    pub async fn handle_text(self: &Arc<Self>, session: &mut Session, text: &str) -> Flow {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("{}", SignalingError::Parse(e));
                return Flow::Continue;
            }
        };

        if !session.authenticated && !msg.is_login() {
            debug!("Ignoring message from unauthenticated connection {}", session.handle.id());
            return Flow::Continue;
        }

        match msg {
            ClientMessage::LoginAuth(Embedded(req)) => self.handle_login(session, req).await,
            ClientMessage::Offer(Embedded(offer)) => {
                self.spawn_offer(session.handle.clone(), offer);
                Flow::Continue
            }
            ClientMessage::Control(Embedded(command)) => {
                let _ = self.events.send(SessionEvent::Control(command));
                self.reply(session, &ServerMessage::ControlResponse(Ack::OK)).await
            }
            ClientMessage::ConnectAdb(address) => {
                let _ = self.events.send(SessionEvent::ConnectAdb(address));
                self.reply(session, &ServerMessage::ConnectAdbResp(Ack::OK)).await
            }
        }
    }

    async fn handle_login(&self, session: &mut Session, req: LoginRequest) -> Flow {
        let ip = session.handle.remote_ip().to_string();
        let outcome = self
            .authenticator
            .verify(&session.security_key, &req, &ip, auth::unix_millis());

        // Locked-out attempts are not surfaced to the application
        if outcome != LoginOutcome::LockedOut {
            if let Some(max_size) = req.max_size {
                self.state.set_max_size(max_size);
            }
            let _ = self.events.send(SessionEvent::LoginInit { max_size: req.max_size });
        }

        match outcome {
            LoginOutcome::LockedOut => {
                warn!("Closing connection from locked-out address {}", ip);
                let _ = session.handle.send(&ServerMessage::LoginAuthResp(AuthResult { auth: false })).await;
                let _ = session.handle.close().await;
                Flow::Close
            }
            LoginOutcome::Replayed => Flow::Continue,
            LoginOutcome::Rejected => {
                self.reply(session, &ServerMessage::LoginAuthResp(AuthResult { auth: false })).await
            }
            LoginOutcome::Accepted => {
                session.authenticated = true;
                let flow = self.reply(session, &ServerMessage::LoginAuthResp(AuthResult { auth: true })).await;
                self.broadcast_info();
                flow
            }
        }
    }

    async fn reply(&self, session: &Session, msg: &ServerMessage) -> Flow {
        match session.handle.send(msg).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                debug!("Reply to {} failed: {}", session.handle.id(), e);
                Flow::Close
            }
        }
    }

    /// Negotiate off the read loop so a slow ICE gathering does not block
    /// other messages on the connection
    fn spawn_offer(self: &Arc<Self>, handle: SessionHandle, offer: RTCSessionDescription) {
        let hub = self.clone();
        tokio::spawn(async move {
            let result = match hub.sink.negotiate(offer).await {
                Ok(answer) => OfferResult {
                    os: std::env::consts::OS.to_string(),
                    sdp: Some(answer),
                    error: None,
                },
                Err(e) => {
                    warn!("SDP negotiation for {} failed: {}", handle.id(), e);
                    OfferResult {
                        os: std::env::consts::OS.to_string(),
                        sdp: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            if let Err(e) = handle.send(&ServerMessage::OfferResponse(result)).await {
                debug!("Offer response to {} dropped: {}", handle.id(), e);
            }
        });
    }

    /// Current stream parameters as sent to viewers
    pub fn info_notify(&self) -> InfoNotify {
        let info = self.state.info();
        InfoNotify {
            orientation: info.orientation,
            video_height: info.height,
            video_width: info.width,
            use_adb: info.use_adb,
            adb_connect: info.adb_connected,
        }
    }

    pub fn broadcast_info(&self) {
        let msg = ServerMessage::InfoNotify(self.info_notify());
        match self.broadcaster.broadcast(&msg) {
            Ok(count) => debug!("infoNotify sent to {} connections", count),
            Err(e) => warn!("infoNotify broadcast failed: {}", e),
        }
    }

    /// Re-broadcast `infoNotify` whenever the stream geometry or adb state
    /// changes. Holds only a weak reference to the hub.
    fn spawn_info_forwarder(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.state.subscribe();
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StreamEvent::GeometryChanged { .. }) | Ok(StreamEvent::AdbStateChanged { .. }) => {
                        let Some(hub) = hub.upgrade() else {
                            break;
                        };
                        hub.broadcast_info();
                    }
                    Ok(StreamEvent::AudioConfigured { .. }) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Info forwarder lagged by {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stop the background sweeps and the info forwarder
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for SignalingHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::media::testing::RecordingSink;
    use serde_json::{json, Value};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    struct Harness {
        hub: Arc<SignalingHub>,
        state: StreamState,
        sink: Arc<RecordingSink>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn harness() -> Harness {
        let config = Config::default();
        let state = StreamState::new(&config);
        let sink = Arc::new(RecordingSink::default());
        let (tx, events) = mpsc::unbounded_channel();
        let hub = SignalingHub::new(&config.auth, sink.clone(), state.clone(), tx);
        Harness { hub, state, sink, events }
    }

    async fn connect(hub: &Arc<SignalingHub>, ip: [u8; 4]) -> (Session, mpsc::Receiver<Outbound>) {
        let (tx, mut rx) = mpsc::channel(32);
        let session = hub.open_session(IpAddr::V4(Ipv4Addr::from(ip)), tx).await;
        let init = next_json(&mut rx).await;
        assert_eq!(init["type"], "initConfig");
        assert_eq!(init["data"]["securityKey"], session.security_key());
        (session, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("channel closed")
    }

    async fn next_json(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        match next(rx).await {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            Outbound::Close => panic!("unexpected close"),
        }
    }

    fn login_text(session: &Session, password: &str, timestamp: i64) -> String {
        let token = auth::compute_token(session.security_key(), timestamp, password);
        let data = json!({"maxSize": 1024, "token": token, "timestamp": timestamp}).to_string();
        json!({"type": "loginAuth", "data": data}).to_string()
    }

    #[tokio::test]
    async fn test_login_success_broadcasts_info() {
        let h = harness();
        let (mut viewer, mut rx) = connect(&h.hub, [192, 168, 1, 10]).await;
        let (_other, mut other_rx) = connect(&h.hub, [192, 168, 1, 11]).await;

        let text = login_text(&viewer, "castbridge", auth::unix_millis());
        assert_eq!(h.hub.handle_text(&mut viewer, &text).await, Flow::Continue);
        assert!(viewer.is_authenticated());

        let resp = next_json(&mut rx).await;
        assert_eq!(resp, json!({"type": "loginAuthResp", "data": {"auth": true}}));
        assert_eq!(next_json(&mut rx).await["type"], "infoNotify");

        let info = next_json(&mut other_rx).await;
        assert_eq!(info["type"], "infoNotify");
        assert_eq!(info["data"]["videoWidth"], 1280);
        assert_eq!(h.state.info().max_size, 1024);
    }

    #[tokio::test]
    async fn test_replayed_login_gets_no_response() {
        let mut h = harness();
        let (mut viewer, mut rx) = connect(&h.hub, [192, 168, 1, 10]).await;
        let text = login_text(&viewer, "castbridge", auth::unix_millis());

        h.hub.handle_text(&mut viewer, &text).await;
        assert_eq!(next_json(&mut rx).await["data"]["auth"], true);
        assert_eq!(next_json(&mut rx).await["type"], "infoNotify");

        assert_eq!(h.hub.handle_text(&mut viewer, &text).await, Flow::Continue);
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        assert_eq!(h.events.recv().await, Some(SessionEvent::LoginInit { max_size: Some(1024) }));
    }

    #[tokio::test]
    async fn test_wrong_password_keeps_connection_open() {
        let h = harness();
        let (mut viewer, mut rx) = connect(&h.hub, [10, 0, 0, 5]).await;
        let text = login_text(&viewer, "wrong", auth::unix_millis());
        assert_eq!(h.hub.handle_text(&mut viewer, &text).await, Flow::Continue);
        assert_eq!(next_json(&mut rx).await["data"]["auth"], false);
        assert!(!viewer.is_authenticated());
    }

    #[tokio::test]
    async fn test_lockout_closes_connection() {
        let mut h = harness();
        let (mut viewer, mut rx) = connect(&h.hub, [10, 0, 0, 6]).await;
        let now = auth::unix_millis();
        for i in 0..21 {
            let text = login_text(&viewer, "wrong", now + i);
            assert_eq!(h.hub.handle_text(&mut viewer, &text).await, Flow::Continue);
            assert_eq!(next_json(&mut rx).await["data"]["auth"], false);
        }

        let text = login_text(&viewer, "castbridge", auth::unix_millis());
        assert_eq!(h.hub.handle_text(&mut viewer, &text).await, Flow::Close);
        assert_eq!(next_json(&mut rx).await["data"]["auth"], false);
        assert_eq!(next(&mut rx).await, Outbound::Close);
        assert!(!viewer.is_authenticated());

        // Only the rejected attempts reach the application
        let mut logins = 0;
        while let Ok(event) = h.events.try_recv() {
            assert!(matches!(event, SessionEvent::LoginInit { .. }));
            logins += 1;
        }
        assert_eq!(logins, 21);
    }

    #[tokio::test]
    async fn test_unauthenticated_messages_ignored() {
        let mut h = harness();
        let (mut viewer, mut rx) = connect(&h.hub, [10, 0, 0, 7]).await;
        let control = json!({"type": "control", "data": "{\"type\":\"tap\"}"}).to_string();
        assert_eq!(h.hub.handle_text(&mut viewer, &control).await, Flow::Continue);
        assert_eq!(h.hub.handle_text(&mut viewer, "not json").await, Flow::Continue);
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_control_offer_and_adb_after_login() {
        let mut h = harness();
        let (mut viewer, mut rx) = connect(&h.hub, [10, 0, 0, 8]).await;
        let text = login_text(&viewer, "castbridge", auth::unix_millis());
        h.hub.handle_text(&mut viewer, &text).await;
        next_json(&mut rx).await;
        next_json(&mut rx).await;
        assert!(matches!(h.events.recv().await, Some(SessionEvent::LoginInit { .. })));

        let control = json!({"type": "control", "data": "{\"type\":\"tap\",\"x\":3}"}).to_string();
        h.hub.handle_text(&mut viewer, &control).await;
        assert_eq!(next_json(&mut rx).await, json!({"type": "controlResponse", "data": {"code": 0}}));
        assert_eq!(
            h.events.recv().await,
            Some(SessionEvent::Control(json!({"type": "tap", "x": 3})))
        );

        let adb = json!({"type": "connectAdb", "data": "192.168.1.20:5555"}).to_string();
        h.hub.handle_text(&mut viewer, &adb).await;
        assert_eq!(next_json(&mut rx).await["type"], "connectAdbResp");
        assert_eq!(
            h.events.recv().await,
            Some(SessionEvent::ConnectAdb("192.168.1.20:5555".to_string()))
        );

        let offer = json!({"type": "offer", "sdp": "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n"}).to_string();
        let msg = json!({"type": "offer", "data": offer}).to_string();
        h.hub.handle_text(&mut viewer, &msg).await;
        let resp = next_json(&mut rx).await;
        assert_eq!(resp["type"], "offerResponse");
        assert_eq!(resp["data"]["sdp"]["type"], "answer");
        assert_eq!(h.sink.offers.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_geometry_change_notifies_viewers() {
        let h = harness();
        let (_viewer, mut rx) = connect(&h.hub, [10, 0, 0, 9]).await;
        h.state.update_geometry(1920, 1080);
        let info = next_json(&mut rx).await;
        assert_eq!(info["type"], "infoNotify");
        assert_eq!(info["data"]["videoWidth"], 1920);
        assert_eq!(info["data"]["videoHeight"], 1080);
    }

    #[tokio::test]
    async fn test_close_session_unregisters() {
        let h = harness();
        let (viewer, _rx) = connect(&h.hub, [10, 0, 0, 10]).await;
        assert_eq!(h.hub.connections(), 1);
        h.hub.close_session(&viewer);
        assert_eq!(h.hub.connections(), 0);
    }
}
