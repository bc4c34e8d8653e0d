// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! api: the JSON control-frame and HTTP contract for the live audio relay.
//!
//! Binary WebSocket frames carry raw opus/webm audio and never pass through
//! this crate. Text frames are always one of the [`BroadcasterFrame`] or
//! [`ListenerFrame`] shapes below, tagged by `type` for TypeScript/JS
//! interop on the client side.

use serde::{Deserialize, Serialize};

/// Text frames sent from the server to the broadcaster socket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "kebab-case")]
pub enum BroadcasterFrame {
    /// The recording sink is not draining; the broadcaster should pause.
    Backpressure,
    /// The recording sink has drained; the broadcaster may resume.
    Drain,
    /// Sent after any listener attach/detach.
    ListenerCount { count: usize },
    /// Fatal admission error (e.g. a second broadcaster attached); socket closes after.
    Error { message: String },
}

/// Text frames sent from the server to a listener socket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ListenerFrame {
    /// Admission confirmation, sent immediately after a successful upgrade.
    Ok { session_id: String },
    /// Emitted when the broadcaster becomes attached, including to listeners
    /// already attached and to listeners attaching after the fact.
    BroadcastStarted,
    /// Precedes a binary init-segment delivery; `size` is the byte length of
    /// the binary frame that immediately follows.
    InitSegment { size: usize },
    /// Final message a listener receives before its socket closes.
    SessionEnded { reason: TeardownReason },
}

/// Why a session was torn down. Shared between [`ListenerFrame::SessionEnded`]
/// and the teardown bookkeeping in the session/lifecycle layer so the wire
/// string and the internal reason can never drift apart.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TeardownReason {
    BroadcasterDisconnected,
    StoppedByBroadcaster,
    Expired,
    Shutdown,
}

impl TeardownReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BroadcasterDisconnected => "broadcaster-disconnected",
            Self::StoppedByBroadcaster => "stopped-by-broadcaster",
            Self::Expired => "expired",
            Self::Shutdown => "shutdown",
        }
    }
}

/// `POST /api/session/create` response body.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub token: String,
    pub listen_url: String,
    /// RFC 3339 formatted expiry instant.
    pub expires_at: String,
}

/// `POST /api/session/{id}/stop` response body.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StopSessionResponse {
    pub ok: bool,
    pub recording: String,
}

/// Role requested by a WebSocket upgrade's `role` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Broadcaster,
    Listener,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "broadcaster" => Some(Self::Broadcaster),
            "listener" => Some(Self::Listener),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcaster_frame_serializes_tagged_kebab_case() {
        let frame = BroadcasterFrame::ListenerCount { count: 3 };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"listener-count","count":3}"#);
    }

    #[test]
    fn listener_frame_session_ended_carries_reason() {
        let frame = ListenerFrame::SessionEnded { reason: TeardownReason::Expired };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"session-ended","reason":"expired"}"#);
    }

    #[test]
    fn listener_frame_ok_uses_camel_case_field() {
        let frame = ListenerFrame::Ok { session_id: "abcd1234".to_string() };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"ok","sessionId":"abcd1234"}"#);
    }

    #[test]
    fn create_session_response_uses_camel_case_fields() {
        let response = CreateSessionResponse {
            session_id: "abcd1234".to_string(),
            token: "deadbeef".repeat(4),
            listen_url: "/listener.html?sid=abcd1234&t=deadbeef".to_string(),
            expires_at: "2026-07-28T00:00:00Z".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""sessionId":"abcd1234""#));
        assert!(json.contains(r#""listenUrl":"#));
        assert!(json.contains(r#""expiresAt":"#));
    }

    #[test]
    fn role_parses_known_values_only() {
        assert_eq!(Role::parse("broadcaster"), Some(Role::Broadcaster));
        assert_eq!(Role::parse("listener"), Some(Role::Listener));
        assert_eq!(Role::parse("admin"), None);
    }
}
