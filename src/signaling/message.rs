//! Signaling wire messages
//!
//! Every WebSocket frame is a JSON envelope `{"type": ..., "data": ...}`.
//! Envelopes are decoded once into [`ClientMessage`] / [`ServerMessage`].
//!
//! Several client payloads travel as a JSON document encoded inside a JSON
//! string; [`Embedded`] accepts both that form and a plain object.

use serde::de::{DeserializeOwned, Error as DeError};
use serde::ser::Error as SerError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Payload carried as a JSON string on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Embedded<T>(pub T);

impl<T: Serialize> Serialize for Embedded<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(&self.0).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Embedded<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(text) => {
                serde_json::from_str(&text).map(Embedded).map_err(D::Error::custom)
            }
            other => serde_json::from_value(other).map(Embedded).map_err(D::Error::custom),
        }
    }
}

/// `loginAuth` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,
    pub token: String,
    /// Client wall clock, milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// Messages sent by a viewer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    LoginAuth(Embedded<LoginRequest>),
    Offer(Embedded<RTCSessionDescription>),
    Control(Embedded<serde_json::Value>),
    ConnectAdb(String),
}

impl ClientMessage {
    pub fn is_login(&self) -> bool {
        matches!(self, ClientMessage::LoginAuth(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    #[serde(rename = "GOOS")]
    pub os: String,
    #[serde(rename = "securityKey")]
    pub security_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub auth: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferResult {
    #[serde(rename = "GOOS")]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<RTCSessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub code: i32,
}

impl Ack {
    pub const OK: Ack = Ack { code: 0 };
}

/// Stream parameters pushed to every viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoNotify {
    pub orientation: u32,
    pub video_height: u32,
    pub video_width: u32,
    pub use_adb: bool,
    pub adb_connect: bool,
}

/// Messages sent by the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    InitConfig(InitConfig),
    LoginAuthResp(AuthResult),
    OfferResponse(OfferResult),
    ControlResponse(Ack),
    ConnectAdbResp(Ack),
    InfoNotify(InfoNotify),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_login_with_string_payload() {
        let text = r#"{"type":"loginAuth","data":"{\"maxSize\":1280,\"token\":\"ab\",\"timestamp\":1700000000000}"}"#;
        let msg: ClientMessage = serde_json::from_str(text).unwrap();
        match msg {
            ClientMessage::LoginAuth(Embedded(req)) => {
                assert_eq!(req.max_size, Some(1280));
                assert_eq!(req.token, "ab");
                assert_eq!(req.timestamp, 1_700_000_000_000);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_login_with_object_payload() {
        let value = json!({"type": "loginAuth", "data": {"token": "cd", "timestamp": 5}});
        let msg: ClientMessage = serde_json::from_value(value).unwrap();
        assert!(msg.is_login());
    }

    #[test]
    fn test_offer_payload_decodes_description() {
        let offer = json!({"type": "offer", "sdp": "v=0\r\n"}).to_string();
        let value = json!({"type": "offer", "data": offer});
        match serde_json::from_value::<ClientMessage>(value).unwrap() {
            ClientMessage::Offer(Embedded(desc)) => assert_eq!(desc.sdp, "v=0\r\n"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let value = json!({"type": "usbConnect", "data": ""});
        assert!(serde_json::from_value::<ClientMessage>(value).is_err());
    }

    #[test]
    fn test_server_envelopes() {
        let msg = ServerMessage::LoginAuthResp(AuthResult { auth: true });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "loginAuthResp", "data": {"auth": true}})
        );

        let msg = ServerMessage::InitConfig(InitConfig {
            os: "linux".to_string(),
            security_key: "k".to_string(),
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "initConfig", "data": {"GOOS": "linux", "securityKey": "k"}})
        );

        let msg = ServerMessage::InfoNotify(InfoNotify {
            orientation: 1,
            video_height: 1080,
            video_width: 1920,
            use_adb: false,
            adb_connect: false,
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "infoNotify", "data": {
                "orientation": 1, "videoHeight": 1080, "videoWidth": 1920,
                "useAdb": false, "adbConnect": false
            }})
        );

        let msg = ServerMessage::ControlResponse(Ack::OK);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "controlResponse", "data": {"code": 0}})
        );
    }

    #[test]
    fn test_client_login_serializes_as_string() {
        let msg = ClientMessage::LoginAuth(Embedded(LoginRequest {
            max_size: Some(720),
            token: "t".to_string(),
            timestamp: 9,
        }));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "loginAuth");
        assert!(value["data"].is_string());
    }
}
