//! Registry of live signaling connections
//!
//! Each connection owns a writer task fed through a bounded channel, so all
//! writes to one socket are serialized there. Broadcasts take the read lock
//! only long enough to clone the handles, then spawn one send per connection.

use super::message::ServerMessage;
use super::SignalingError;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Frames queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Cloneable write side of one connection
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    remote_ip: IpAddr,
    tx: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    pub fn new(remote_ip: IpAddr, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_ip,
            tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_ip
    }

    pub async fn send_text(&self, text: String) -> Result<(), SignalingError> {
        self.tx
            .send(Outbound::Text(text))
            .await
            .map_err(|_| SignalingError::Closed)
    }

    pub async fn send(&self, msg: &ServerMessage) -> Result<(), SignalingError> {
        let text = serde_json::to_string(msg).map_err(SignalingError::Serialize)?;
        self.send_text(text).await
    }

    pub async fn close(&self) -> Result<(), SignalingError> {
        self.tx
            .send(Outbound::Close)
            .await
            .map_err(|_| SignalingError::Closed)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionBroadcaster {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
}

impl ConnectionBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handle: SessionHandle) {
        self.sessions.write().insert(handle.id(), handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<SessionHandle> {
        self.sessions.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `msg` to every connection. Returns the number of sends started.
    pub fn broadcast(&self, msg: &ServerMessage) -> Result<usize, SignalingError> {
        let text = serde_json::to_string(msg).map_err(SignalingError::Serialize)?;
        let handles: Vec<SessionHandle> = self.sessions.read().values().cloned().collect();
        let count = handles.len();
        for handle in handles {
            let text = text.clone();
            tokio::spawn(async move {
                if handle.send_text(text).await.is_err() {
                    debug!("Broadcast to {} dropped: connection closed", handle.id());
                }
            });
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::message::{AuthResult, ServerMessage};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn handle(capacity: usize) -> (SessionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (SessionHandle::new(IpAddr::V4(Ipv4Addr::LOCALHOST), tx), rx)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all() {
        let broadcaster = ConnectionBroadcaster::new();
        let (a, mut rx_a) = handle(4);
        let (b, mut rx_b) = handle(4);
        broadcaster.add(a);
        broadcaster.add(b);

        let msg = ServerMessage::LoginAuthResp(AuthResult { auth: true });
        assert_eq!(broadcaster.broadcast(&msg).unwrap(), 2);

        let expected = Outbound::Text(serde_json::to_string(&msg).unwrap());
        assert_eq!(rx_a.recv().await, Some(expected.clone()));
        assert_eq!(rx_b.recv().await, Some(expected));
    }

    #[tokio::test]
    async fn test_blocked_session_does_not_stall_others() {
        let broadcaster = ConnectionBroadcaster::new();
        let (slow, _rx_slow) = handle(1);
        let (fast, mut rx_fast) = handle(8);
        // Fill the slow session's queue
        slow.send_text("pending".to_string()).await.unwrap();
        broadcaster.add(slow);
        broadcaster.add(fast);

        let msg = ServerMessage::LoginAuthResp(AuthResult { auth: false });
        broadcaster.broadcast(&msg).unwrap();
        broadcaster.broadcast(&msg).unwrap();

        for _ in 0..2 {
            let got = tokio::time::timeout(Duration::from_secs(1), rx_fast.recv()).await.unwrap();
            assert!(matches!(got, Some(Outbound::Text(_))));
        }
    }

    #[tokio::test]
    async fn test_remove() {
        let broadcaster = ConnectionBroadcaster::new();
        let (a, _rx) = handle(1);
        let id = a.id();
        broadcaster.add(a);
        assert_eq!(broadcaster.len(), 1);
        assert!(broadcaster.remove(&id).is_some());
        assert!(broadcaster.is_empty());
        let msg = ServerMessage::LoginAuthResp(AuthResult { auth: true });
        assert_eq!(broadcaster.broadcast(&msg).unwrap(), 0);
    }
}
