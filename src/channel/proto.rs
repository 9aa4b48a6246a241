//! Realtime channel wire messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logical subscription group scoping server-originated events.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Room {
    Dashboard,
    Logs,
}

/// Client-to-server frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Connect-time negotiation; sent once by the transport.
    Auth {
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Subscribe {
        room: Room,
    },
    Unsubscribe {
        room: Room,
    },
    /// Liveness ping with the client clock in unix milliseconds.
    Heartbeat {
        timestamp: u64,
    },
    /// Asks the server to re-broadcast current state to a room.
    RequestUpdate {
        room: Room,
    },
}

/// Server-to-client frames: `{"event": <name>, "data": <payload>}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        status: String,
        client_id: String,
    },
    Subscribed {
        room: Room,
    },
    Unsubscribed {
        room: Room,
    },
    HeartbeatAck {
        timestamp: String,
    },
    BotDetection(Value),
    DashboardUpdate(Value),
    SystemAlert(Value),
    LogEntry(Value),
    ConnectionCount {
        connected_clients: u64,
        timestamp: String,
    },
    /// Event names this SDK version does not know; dropped by the channel.
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ClientFrame, Room, ServerFrame};

    fn round_trip<T>(value: T)
    where
        T: serde::Serialize + for<'de> serde::Deserialize<'de> + PartialEq + std::fmt::Debug,
    {
        let json = serde_json::to_string(&value).expect("serialize");
        let decoded: T = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(value, decoded);
    }

    #[test]
    fn subscribe_frame_wire_shape() {
        let frame = ClientFrame::Subscribe {
            room: Room::Dashboard,
        };
        let encoded = frame.to_text().expect("encode");
        assert_eq!(encoded, r#"{"type":"subscribe","room":"dashboard"}"#);
        round_trip(frame);
    }

    #[test]
    fn heartbeat_frame_carries_unix_millis() {
        let frame = ClientFrame::Heartbeat {
            timestamp: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value.get("type").and_then(|v| v.as_str()), Some("heartbeat"));
        assert_eq!(
            value.get("timestamp").and_then(|v| v.as_u64()),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn auth_frame_omits_missing_token() {
        let frame = ClientFrame::Auth { token: None };
        assert_eq!(frame.to_text().expect("encode"), r#"{"type":"auth"}"#);

        let frame = ClientFrame::Auth {
            token: Some("jwt".to_string()),
        };
        assert_eq!(
            frame.to_text().expect("encode"),
            r#"{"type":"auth","token":"jwt"}"#
        );
    }

    #[test]
    fn log_entry_frame_decodes_payload_verbatim() {
        let text = r#"{"event":"log_entry","data":{"level":"ERROR","message":"x"}}"#;
        let frame = ServerFrame::from_text(text).expect("decode");
        assert_eq!(
            frame,
            ServerFrame::LogEntry(json!({"level":"ERROR","message":"x"}))
        );
    }

    #[test]
    fn heartbeat_ack_round_trip() {
        round_trip(ServerFrame::HeartbeatAck {
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        });
    }

    #[test]
    fn connection_count_round_trip() {
        round_trip(ServerFrame::ConnectionCount {
            connected_clients: 3,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        });
    }

    #[test]
    fn unknown_event_decodes_to_unknown() {
        let text = r#"{"event":"brand_new_event","data":{"x":1}}"#;
        let frame = ServerFrame::from_text(text).expect("decode");
        assert_eq!(frame, ServerFrame::Unknown);
    }
}
