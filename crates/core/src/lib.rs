// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared primitives for the live audio relay: error types and the
//! id/token format used to address and authenticate sessions.

pub mod error;
pub mod ids;

pub use error::{RecordingError, RelayError, SessionError};
pub use ids::{new_session_id, new_session_token};
