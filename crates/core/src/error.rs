// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for the relay.
//!
//! Each type maps to one boundary in the system: [`SessionError`] crosses
//! the UpgradeGate and the session-scoped HTTP routes, [`RecordingError`]
//! stays internal to the RecordingSink and is only ever logged, and
//! [`RelayError`] unifies both for call sites (like session creation) that
//! need a single return type.

use thiserror::Error;

/// Errors raised while admitting or addressing a session.
///
/// Mirrors the error taxonomy table in the specification: every variant
/// here corresponds to a named admission failure, not a generic catch-all.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session exists for the given id, or it has already torn down.
    #[error("session not found")]
    NotFound,

    /// A broadcaster socket attempted to attach while one was already live.
    #[error("broadcaster already present")]
    BroadcasterAlreadyPresent,

    /// A listener attach was rejected because `MAX_LISTENERS_PER_SESSION` was reached.
    #[error("listener capacity exceeded")]
    CapacityExceeded,

    /// A listener or broadcaster attach was rejected because the session already ended.
    #[error("session is not live")]
    SessionNotLive,

    /// A listener upgrade presented a token that does not match the session's.
    #[error("bad token")]
    BadToken,
}

/// Errors raised by the [`RecordingSink`](crate) write path.
///
/// Never surfaced to the broadcaster: callers log and continue per the
/// "recording write error degrades recording, not live relay" rule.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Umbrella error for call sites that need one return type across both
/// session admission and recording I/O (e.g. session creation, which opens
/// a recording file as part of allocating the session).
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
