//! Frame types for the SkyStage relay protocol.
//!
//! A frame is either part of the connection handshake or a named event
//! carrying a JSON payload. Frames are serialized with MessagePack on the
//! binary path and with JSON on the text path.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;
use crate::events::Intent;

/// Frame kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameKind {
    Connect = 0x01,
    Connected = 0x02,
    Event = 0x03,
    Error = 0x04,
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameKind::Connect),
            0x02 => Ok(FrameKind::Connected),
            0x03 => Ok(FrameKind::Event),
            0x04 => Ok(FrameKind::Error),
            _ => Err("Invalid frame kind"),
        }
    }
}

/// Well-known error codes carried by [`Frame::Error`].
pub mod error_codes {
    /// The client spoke an incompatible protocol version.
    pub const UNSUPPORTED_VERSION: u16 = 1001;
    /// The handshake was missing or malformed.
    pub const BAD_HANDSHAKE: u16 = 1002;
    /// The frame could not be decoded.
    pub const MALFORMED_FRAME: u16 = 1003;
    /// The event referenced a room the sender has not joined.
    pub const NOT_IN_ROOM: u16 = 1004;
    /// A server-side limit was hit.
    pub const LIMIT_EXCEEDED: u16 = 1005;
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// First frame sent by a client after the socket opens.
    #[serde(rename = "connect")]
    Connect {
        /// Major protocol version spoken by the client.
        version: u8,
        /// Bearer token, if the client has one.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// User the connection acts for.
        user_id: String,
    },

    /// Server reply to a successful handshake.
    #[serde(rename = "connected")]
    Connected {
        /// Server-assigned connection identifier.
        connection_id: String,
        /// Negotiated major protocol version.
        version: u8,
        /// Heartbeat interval the server expects, in milliseconds.
        heartbeat: u32,
    },

    /// A named event with a JSON payload.
    #[serde(rename = "event")]
    Event {
        /// Event name, e.g. `show:join`.
        event: String,
        /// Event payload.
        #[serde(default)]
        data: Value,
    },

    /// Error notification. Not tied to any particular request.
    #[serde(rename = "error")]
    Error {
        /// Error code, see [`error_codes`].
        code: u16,
        /// Human-readable message.
        message: String,
    },
}

impl Frame {
    /// Get the frame kind.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Connect { .. } => FrameKind::Connect,
            Frame::Connected { .. } => FrameKind::Connected,
            Frame::Event { .. } => FrameKind::Event,
            Frame::Error { .. } => FrameKind::Error,
        }
    }

    /// Create a Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: Option<String>, user_id: impl Into<String>) -> Self {
        Frame::Connect {
            version,
            token,
            user_id: user_id.into(),
        }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create an Event frame from a name and an already-built payload.
    #[must_use]
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Frame::Event {
            event: event.into(),
            data,
        }
    }

    /// Create an Event frame from a typed intent.
    ///
    /// # Errors
    ///
    /// Returns an error if the intent cannot be represented as JSON.
    pub fn intent<I: Intent>(intent: &I) -> Result<Self, ProtocolError> {
        Ok(Frame::Event {
            event: I::EVENT.to_string(),
            data: serde_json::to_value(intent)?,
        })
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            code,
            message: message.into(),
        }
    }

    /// Event name, if this is an Event frame.
    #[must_use]
    pub fn event_name(&self) -> Option<&str> {
        match self {
            Frame::Event { event, .. } => Some(event),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{names, JoinShow};

    #[test]
    fn test_frame_kind() {
        let connect = Frame::connect(1, None, "user-1");
        assert_eq!(connect.kind(), FrameKind::Connect);

        let event = Frame::event("cursor:move", Value::Null);
        assert_eq!(event.kind(), FrameKind::Event);
        assert_eq!(event.event_name(), Some("cursor:move"));
        assert_eq!(connect.event_name(), None);
    }

    #[test]
    fn test_frame_kind_conversion() {
        assert_eq!(FrameKind::try_from(0x03), Ok(FrameKind::Event));
        assert_eq!(u8::from(FrameKind::Error), 0x04);
        assert!(FrameKind::try_from(0x7f).is_err());
    }

    #[test]
    fn test_intent_frame_uses_event_name() {
        let frame = Frame::intent(&JoinShow {
            room_id: "show-42".into(),
            user_id: "user-1".into(),
        })
        .unwrap();

        match frame {
            Frame::Event { event, data } => {
                assert_eq!(event, names::SHOW_JOIN);
                assert_eq!(data["roomId"], "show-42");
                assert_eq!(data["userId"], "user-1");
            }
            other => panic!("Expected event frame, got {:?}", other),
        }
    }

    #[test]
    fn test_json_shape() {
        let frame = Frame::event("ping", serde_json::json!({ "timestamp": 10 }));
        let text = serde_json::to_string(&frame).unwrap();
        assert_eq!(
            text,
            r#"{"type":"event","event":"ping","data":{"timestamp":10}}"#
        );
    }
}
