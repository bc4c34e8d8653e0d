// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `UpgradeGate`: decides, before completing a WebSocket upgrade, whether
//! the connection is admitted at all.
//!
//! Every rejection here is a raw socket close with no JSON error frame --
//! the connection never got far enough to speak the wire protocol. Checks
//! that can only be performed after a socket exists (a second broadcaster
//! attaching, for instance) are not this module's job; they live on
//! [`crate::session::Session`] and are reported as a JSON error frame
//! followed by a clean close.

use relay_api::Role;

use crate::session::{Session, SessionStore};

/// Parsed and validated query parameters for a WebSocket upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub session_id: String,
    pub role: Role,
    pub token: Option<String>,
}

impl UpgradeRequest {
    /// Parses `sid`, `role`, and `t` from a query string's already-decoded
    /// key/value pairs. Returns `None` if `sid` or `role` is missing or
    /// `role` is not a recognized value.
    pub fn from_query_pairs<'a, I>(pairs: I) -> Option<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut session_id = None;
        let mut role = None;
        let mut token = None;

        for (key, value) in pairs {
            match key {
                "sid" => session_id = Some(value.to_string()),
                "role" => role = Role::parse(value),
                "t" => token = Some(value.to_string()),
                _ => {}
            }
        }

        Some(Self { session_id: session_id?, role: role?, token })
    }
}

/// Why an upgrade was refused. Every variant closes the raw socket with no
/// application-level frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
    MissingParameters,
    SessionNotFound,
    BadToken,
    CapacityExceeded,
}

/// Admits or rejects an upgrade request against the current session
/// registry. On success, returns the session the caller should attach the
/// new socket to; the caller still performs the actual attach (which can
/// itself fail, e.g. `BroadcasterAlreadyPresent`, after the gate passes).
pub async fn admit(
    store: &SessionStore,
    request: &UpgradeRequest,
) -> Result<std::sync::Arc<Session>, GateRejection> {
    let session = store.get(&request.session_id).await.ok_or(GateRejection::SessionNotFound)?;

    if request.role == Role::Listener {
        match &request.token {
            Some(token) if *token == session.token => {}
            _ => return Err(GateRejection::BadToken),
        }

        if session.listener_count().await >= session.max_listeners() {
            return Err(GateRejection::CapacityExceeded);
        }
    }

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;

    fn test_store() -> Arc<SessionStore> {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.recordings.dir = dir.path().to_string_lossy().into_owned();
        let _ = dir.into_path();
        SessionStore::new(Arc::new(config))
    }

    #[test]
    fn missing_sid_or_role_fails_to_parse() {
        assert!(UpgradeRequest::from_query_pairs(vec![("role", "broadcaster")]).is_none());
        assert!(UpgradeRequest::from_query_pairs(vec![("sid", "abcd1234")]).is_none());
        assert!(UpgradeRequest::from_query_pairs(vec![
            ("sid", "abcd1234"),
            ("role", "admin")
        ])
        .is_none());
    }

    #[test]
    fn valid_pairs_parse_into_request() {
        let request = UpgradeRequest::from_query_pairs(vec![
            ("sid", "abcd1234"),
            ("role", "listener"),
            ("t", "secret"),
        ])
        .unwrap();
        assert_eq!(request.session_id, "abcd1234");
        assert_eq!(request.role, Role::Listener);
        assert_eq!(request.token.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let store = test_store();
        let request = UpgradeRequest {
            session_id: "deadbeef".to_string(),
            role: Role::Broadcaster,
            token: None,
        };
        assert_eq!(admit(&store, &request).await.unwrap_err(), GateRejection::SessionNotFound);
    }

    #[tokio::test]
    async fn listener_with_wrong_token_is_rejected() {
        let store = test_store();
        let session = store.create().await.unwrap();
        let request = UpgradeRequest {
            session_id: session.id.clone(),
            role: Role::Listener,
            token: Some("wrong".to_string()),
        };
        assert_eq!(admit(&store, &request).await.unwrap_err(), GateRejection::BadToken);
    }

    #[tokio::test]
    async fn listener_with_correct_token_is_admitted() {
        let store = test_store();
        let session = store.create().await.unwrap();
        let request = UpgradeRequest {
            session_id: session.id.clone(),
            role: Role::Listener,
            token: Some(session.token.clone()),
        };
        assert!(admit(&store, &request).await.is_ok());
    }

    #[tokio::test]
    async fn listener_is_rejected_once_capacity_is_reached() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.recordings.dir = dir.path().to_string_lossy().into_owned();
        config.session.max_listeners = 1;
        let _ = dir.into_path();
        let store = SessionStore::new(Arc::new(config));
        let session = store.create().await.unwrap();

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        session.attach_listener(tx).await.unwrap();

        let request = UpgradeRequest {
            session_id: session.id.clone(),
            role: Role::Listener,
            token: Some(session.token.clone()),
        };
        assert_eq!(admit(&store, &request).await.unwrap_err(), GateRejection::CapacityExceeded);
    }

    #[tokio::test]
    async fn broadcaster_needs_no_token() {
        let store = test_store();
        let session = store.create().await.unwrap();
        let request = UpgradeRequest {
            session_id: session.id.clone(),
            role: Role::Broadcaster,
            token: None,
        };
        assert!(admit(&store, &request).await.is_ok());
    }
}
