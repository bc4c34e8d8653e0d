// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Process-level lifecycle glue.
//!
//! Per-session triggers (TTL expiry, backpressure drain) are scheduled by
//! `Session`/`SessionStore` themselves since they need direct access to
//! session-private state. This module only covers the one teardown trigger
//! that is inherently process-wide: a graceful shutdown must end every live
//! session before the process exits, so no broadcaster or listener socket
//! is simply dropped without a `SessionEnded` frame.

use std::sync::Arc;

use relay_api::TeardownReason;
use tracing::info;

use crate::session::SessionStore;

/// Tears down every live session with [`TeardownReason::Shutdown`]. Called
/// once, after the signal handler that triggers graceful shutdown fires and
/// before the process exits.
pub async fn shutdown_all_sessions(store: &Arc<SessionStore>) {
    info!("tearing down all live sessions for shutdown");
    store.teardown_all(TeardownReason::Shutdown).await;
}
