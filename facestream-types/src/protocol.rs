/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! JSON envelopes spoken on the `/ws/stream` push socket.
//!
//! Both directions are closed tagged unions discriminated by `type`; a
//! message with an unknown discriminant fails to parse and is rejected at
//! the boundary rather than silently ignored.

use serde::{Deserialize, Serialize};

use crate::SessionId;

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// Bind this connection to a stream session.
    #[serde(rename_all = "camelCase")]
    Subscribe { session_id: SessionId },
    /// Detach from the currently bound session.
    Unsubscribe,
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// Acknowledges a successful `subscribe`.
    #[serde(rename_all = "camelCase")]
    Subscribed {
        session_id: SessionId,
        message: String,
    },
    /// One complete JPEG frame, base64 encoded.
    #[serde(rename_all = "camelCase")]
    Frame {
        session_id: SessionId,
        /// Base64 of the JPEG bytes.
        data: String,
        /// Producer wall clock, milliseconds since the Unix epoch.
        timestamp: i64,
    },
    /// The session this client was bound to has ended.
    #[serde(rename_all = "camelCase")]
    StreamStopped {
        session_id: SessionId,
        message: String,
    },
    /// Request-level failure, human readable.
    Error { message: String },
}

impl ClientEnvelope {
    /// Parse a text frame received from a client.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ServerEnvelope {
    /// Serialise for the wire. Envelopes are built from internal state and
    /// always serialise cleanly.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            "{\"type\":\"error\",\"message\":\"internal serialization failure\"}".to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe() {
        let env = ClientEnvelope::from_json(r#"{"type":"subscribe","sessionId":"abc-123"}"#)
            .expect("valid subscribe");
        assert_eq!(
            env,
            ClientEnvelope::Subscribe {
                session_id: "abc-123".to_string()
            }
        );
    }

    #[test]
    fn parses_unsubscribe() {
        let env =
            ClientEnvelope::from_json(r#"{"type":"unsubscribe"}"#).expect("valid unsubscribe");
        assert_eq!(env, ClientEnvelope::Unsubscribe);
    }

    #[test]
    fn rejects_unknown_discriminant() {
        assert!(ClientEnvelope::from_json(r#"{"type":"start_stream","cameraId":"7"}"#).is_err());
    }

    #[test]
    fn rejects_missing_session_id() {
        assert!(ClientEnvelope::from_json(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn frame_envelope_uses_wire_field_names() {
        let env = ServerEnvelope::Frame {
            session_id: "s1".to_string(),
            data: "AAAA".to_string(),
            timestamp: 1_700_000_000_000,
        };
        let json = env.to_json();
        assert!(json.contains(r#""type":"frame""#));
        assert!(json.contains(r#""sessionId":"s1""#));
        assert!(json.contains(r#""timestamp":1700000000000"#));
    }

    #[test]
    fn stream_stopped_round_trips() {
        let env = ServerEnvelope::StreamStopped {
            session_id: "s1".to_string(),
            message: "transcoder exited".to_string(),
        };
        let back: ServerEnvelope = serde_json::from_str(&env.to_json()).expect("round trip");
        assert_eq!(back, env);
    }
}
