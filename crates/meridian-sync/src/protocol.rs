//! # Realtime Protocol
//!
//! Engine.IO v4 / Socket.IO v5 framing and the typed events carried on it.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Realtime Protocol Messages                         │
//! │                                                                         │
//! │  ENGINE FRAMES (one websocket text frame each)                         │
//! │  ─────────────                                                         │
//! │  "0{sid,...}" open   "1" close   "2" ping   "3" pong   "6" noop        │
//! │  "4<socket packet>"  message                                           │
//! │                                                                         │
//! │  SOCKET PACKETS (after the engine "4")                                 │
//! │  ──────────────                                                        │
//! │  "0{auth}"           CONNECT        client → server (credentials)      │
//! │  "0{sid}"            CONNECT        server → client (established)      │
//! │  "1"                 DISCONNECT     server kicked us                   │
//! │  "2[name,arg]"       EVENT                                             │
//! │  "3<id>[args]"       ACK                                               │
//! │  "4{message}"        CONNECT_ERROR  credentials refused                │
//! │                                                                         │
//! │  HANDSHAKE                                                             │
//! │  ─────────                                                             │
//! │  CLIENT ───► 40{"token","userId","role","timestamp"}                   │
//! │  SERVER ◄─── 40{"sid"}        then  42["authenticated",{...}]          │
//! │  CLIENT ───► 42["request_sync",{"type":"initial"}]                     │
//! │  SERVER ◄─── 42["full_sync",{"orders":[..],"users":[..]}]              │
//! │                                                                         │
//! │  ACTIONS                                                               │
//! │  ───────                                                               │
//! │  CLIENT ───► 42["action",{"id","type","payload","timestamp"}]          │
//! │  SERVER ◄─── 42["action_response",{"actionId","success","data"}]       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

/// Engine.IO protocol revision spoken by the server.
pub const ENGINE_IO_VERSION: u8 = 4;

// =============================================================================
// Engine Frames
// =============================================================================

/// One Engine.IO frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Value),
    Close,
    Ping,
    Pong,
    Message(SocketPacket),
    Noop,
}

/// A Socket.IO packet on the default namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, data: Option<Value> },
    Ack { id: u64, args: Vec<Value> },
    ConnectError(Value),
}

impl Packet {
    /// Serializes to a websocket text frame.
    pub fn encode(&self) -> SyncResult<String> {
        Ok(match self {
            Packet::Open(data) => format!("0{}", serde_json::to_string(data)?),
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Noop => "6".to_string(),
            Packet::Message(socket) => format!("4{}", socket.encode()?),
        })
    }

    /// Parses a websocket text frame.
    pub fn decode(frame: &str) -> SyncResult<Packet> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| SyncError::InvalidPacket("empty frame".into()))?;
        let rest = chars.as_str();

        match kind {
            '0' => Ok(Packet::Open(parse_json(rest)?)),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => Ok(Packet::Message(SocketPacket::decode(rest)?)),
            '6' => Ok(Packet::Noop),
            other => Err(SyncError::InvalidPacket(format!(
                "unknown engine packet type '{}'",
                other
            ))),
        }
    }

    /// Shorthand for an outgoing socket event.
    pub fn event(name: &str, data: Option<Value>) -> Packet {
        Packet::Message(SocketPacket::Event {
            name: name.to_string(),
            data,
        })
    }
}

impl SocketPacket {
    fn encode(&self) -> SyncResult<String> {
        Ok(match self {
            SocketPacket::Connect(None) => "0".to_string(),
            SocketPacket::Connect(Some(auth)) => format!("0{}", serde_json::to_string(auth)?),
            SocketPacket::Disconnect => "1".to_string(),
            SocketPacket::Event { name, data } => {
                let mut args = vec![Value::String(name.clone())];
                args.extend(data.iter().cloned());
                format!("2{}", serde_json::to_string(&args)?)
            }
            SocketPacket::Ack { id, args } => format!("3{}{}", id, serde_json::to_string(args)?),
            SocketPacket::ConnectError(err) => format!("4{}", serde_json::to_string(err)?),
        })
    }

    fn decode(body: &str) -> SyncResult<SocketPacket> {
        let mut chars = body.chars();
        let kind = chars
            .next()
            .ok_or_else(|| SyncError::InvalidPacket("empty socket packet".into()))?;
        let mut rest = chars.as_str();

        // Namespaced packets look like "2/admin,[...]"; only "/" is joined
        if rest.starts_with('/') {
            let (namespace, tail) = match rest.find(',') {
                Some(idx) => (&rest[..idx], &rest[idx + 1..]),
                None => (rest, ""),
            };
            if namespace != "/" {
                return Err(SyncError::InvalidPacket(format!(
                    "packet for unjoined namespace {}",
                    namespace
                )));
            }
            rest = tail;
        }

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (ack_id, json) = rest.split_at(digits);

        match kind {
            '0' => Ok(SocketPacket::Connect(parse_optional_json(json)?)),
            '1' => Ok(SocketPacket::Disconnect),
            '2' => {
                let mut args = match parse_json(json)? {
                    Value::Array(args) => args,
                    other => {
                        return Err(SyncError::InvalidPacket(format!(
                            "event payload is not an array: {}",
                            other
                        )))
                    }
                };
                if args.is_empty() {
                    return Err(SyncError::InvalidPacket("event without a name".into()));
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(SyncError::InvalidPacket(format!(
                            "event name is not a string: {}",
                            other
                        )))
                    }
                };
                Ok(SocketPacket::Event {
                    name,
                    data: args.into_iter().next(),
                })
            }
            '3' => {
                let id = ack_id
                    .parse::<u64>()
                    .map_err(|_| SyncError::InvalidPacket("ack without id".into()))?;
                let args = match parse_json(json)? {
                    Value::Array(args) => args,
                    other => vec![other],
                };
                Ok(SocketPacket::Ack { id, args })
            }
            '4' => Ok(SocketPacket::ConnectError(
                parse_optional_json(json)?.unwrap_or(Value::Null),
            )),
            other => Err(SyncError::InvalidPacket(format!(
                "unsupported socket packet type '{}'",
                other
            ))),
        }
    }
}

fn parse_json(raw: &str) -> SyncResult<Value> {
    serde_json::from_str(raw).map_err(|e| SyncError::InvalidPacket(e.to_string()))
}

fn parse_optional_json(raw: &str) -> SyncResult<Option<Value>> {
    if raw.is_empty() {
        Ok(None)
    } else {
        parse_json(raw).map(Some)
    }
}

/// Pulls a human-readable message out of `"text"` or `{"message": "text"}`.
pub fn error_message(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .or_else(|| obj.get("error"))
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| value.to_string()),
        Value::Null => "unknown error".to_string(),
        other => other.to_string(),
    }
}

// =============================================================================
// Client → Server Events
// =============================================================================

/// Credentials sent in the CONNECT packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    pub token: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub timestamp: i64,
}

impl ConnectAuth {
    pub fn into_packet(self) -> SyncResult<Packet> {
        Ok(Packet::Message(SocketPacket::Connect(Some(
            serde_json::to_value(self)?,
        ))))
    }
}

/// Which kind of full sync is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Initial,
    Manual,
}

/// Action envelope, correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: String,
    pub payload: Value,
    pub timestamp: i64,
}

/// Events the client emits.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Ping,
    RequestSync(SyncKind),
    RequestSyncUsers,
    Action(ActionEnvelope),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Ping => "ping",
            ClientEvent::RequestSync(_) => "request_sync",
            ClientEvent::RequestSyncUsers => "request_sync_users",
            ClientEvent::Action(_) => "action",
        }
    }

    pub fn into_packet(self) -> SyncResult<Packet> {
        let name = self.name();
        let data = match self {
            ClientEvent::Ping | ClientEvent::RequestSyncUsers => None,
            ClientEvent::RequestSync(kind) => Some(serde_json::json!({ "type": kind })),
            ClientEvent::Action(envelope) => Some(serde_json::to_value(envelope)?),
        };
        Ok(Packet::event(name, data))
    }
}

// =============================================================================
// Server → Client Events
// =============================================================================

/// Incremental push for one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataUpdate {
    #[serde(rename = "type")]
    pub channel: String,
    #[serde(default)]
    pub payload: Value,
}

/// Reply to an action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub action_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ActionResponse {
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(error_message)
            .unwrap_or_else(|| "action failed".to_string())
    }
}

/// Events the server pushes.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Authenticated(Value),
    AuthError(String),
    DataUpdate(DataUpdate),
    /// Channel name → payload.
    FullSync(Map<String, Value>),
    UsersData(Value),
    ActionResponse(ActionResponse),
    Pong,
    Unknown { name: String, data: Option<Value> },
}

impl ServerEvent {
    /// Types a socket EVENT by name.
    pub fn from_event(name: String, data: Option<Value>) -> SyncResult<ServerEvent> {
        let payload = data.unwrap_or(Value::Null);

        Ok(match name.as_str() {
            "authenticated" => ServerEvent::Authenticated(payload),
            "auth_error" => ServerEvent::AuthError(error_message(&payload)),
            "data_update" => ServerEvent::DataUpdate(serde_json::from_value(payload)?),
            "full_sync" => match payload {
                Value::Object(channels) => ServerEvent::FullSync(channels),
                other => {
                    return Err(SyncError::InvalidPacket(format!(
                        "full_sync payload is not an object: {}",
                        other
                    )))
                }
            },
            "data:users" => ServerEvent::UsersData(payload),
            "action_response" => ServerEvent::ActionResponse(serde_json::from_value(payload)?),
            "pong" => ServerEvent::Pong,
            _ => ServerEvent::Unknown {
                data: (!payload.is_null()).then_some(payload),
                name,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_engine_frames() {
        assert_eq!(Packet::decode("2").unwrap(), Packet::Ping);
        assert_eq!(Packet::decode("6").unwrap(), Packet::Noop);
        match Packet::decode(r#"0{"sid":"abc","pingInterval":25000}"#).unwrap() {
            Packet::Open(v) => assert_eq!(v["sid"], "abc"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(Packet::decode("").is_err());
        assert!(Packet::decode("9").is_err());
    }

    #[test]
    fn test_decode_socket_packets() {
        assert_eq!(
            Packet::decode(r#"40{"sid":"s1"}"#).unwrap(),
            Packet::Message(SocketPacket::Connect(Some(json!({"sid": "s1"}))))
        );
        assert_eq!(
            Packet::decode("41").unwrap(),
            Packet::Message(SocketPacket::Disconnect)
        );
        assert_eq!(
            Packet::decode(r#"44{"message":"invalid token"}"#).unwrap(),
            Packet::Message(SocketPacket::ConnectError(json!({"message": "invalid token"})))
        );
        assert_eq!(
            Packet::decode(r#"42["data_update",{"type":"orders","payload":[]}]"#).unwrap(),
            Packet::event("data_update", Some(json!({"type": "orders", "payload": []})))
        );
        assert_eq!(
            Packet::decode(r#"4312["ok"]"#).unwrap(),
            Packet::Message(SocketPacket::Ack { id: 12, args: vec![json!("ok")] })
        );
    }

    #[test]
    fn test_decode_rejects_other_namespaces() {
        assert_eq!(
            Packet::decode(r#"42/,["pong"]"#).unwrap(),
            Packet::event("pong", None)
        );
        assert!(matches!(
            Packet::decode(r#"42/admin,["full_sync",{"orders":[]}]"#),
            Err(SyncError::InvalidPacket(_))
        ));
        assert!(Packet::decode("40/admin").is_err());
    }

    #[test]
    fn test_encode_client_packets() {
        let auth = ConnectAuth {
            token: "tok".into(),
            user_id: "7".into(),
            role: Some("manager".into()),
            timestamp: 1_700_000_000_000,
        };
        let frame = auth.into_packet().unwrap().encode().unwrap();
        assert!(frame.starts_with("40{"));
        let body: Value = serde_json::from_str(&frame[2..]).unwrap();
        assert_eq!(body["userId"], "7");
        assert_eq!(body["role"], "manager");

        assert_eq!(
            ClientEvent::RequestSync(SyncKind::Initial)
                .into_packet()
                .unwrap()
                .encode()
                .unwrap(),
            r#"42["request_sync",{"type":"initial"}]"#
        );
        assert_eq!(
            ClientEvent::RequestSyncUsers.into_packet().unwrap().encode().unwrap(),
            r#"42["request_sync_users"]"#
        );
        assert_eq!(Packet::Pong.encode().unwrap(), "3");
    }

    #[test]
    fn test_action_envelope_wire_names() {
        let envelope = ActionEnvelope {
            id: "a1".into(),
            action_type: "mark_notification_read".into(),
            payload: json!({"notificationId": "n1"}),
            timestamp: 1,
        };
        let packet = ClientEvent::Action(envelope).into_packet().unwrap();
        match packet {
            Packet::Message(SocketPacket::Event { name, data }) => {
                assert_eq!(name, "action");
                let data = data.unwrap();
                assert_eq!(data["type"], "mark_notification_read");
                assert_eq!(data["id"], "a1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_server_event_typing() {
        let ev = ServerEvent::from_event(
            "action_response".into(),
            Some(json!({"actionId": "a1", "success": false, "error": {"message": "denied"}})),
        )
        .unwrap();
        match ev {
            ServerEvent::ActionResponse(resp) => {
                assert_eq!(resp.action_id, "a1");
                assert_eq!(resp.error_message(), "denied");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            ServerEvent::from_event("auth_error".into(), Some(json!("expired"))).unwrap(),
            ServerEvent::AuthError("expired".into())
        );
        assert!(ServerEvent::from_event("full_sync".into(), Some(json!([1]))).is_err());
        assert!(matches!(
            ServerEvent::from_event("something_else".into(), None).unwrap(),
            ServerEvent::Unknown { .. }
        ));
    }
}
