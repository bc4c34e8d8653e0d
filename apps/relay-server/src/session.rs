// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `Session` and `SessionStore`: the registry of live broadcasts and the
//! aggregate state for each one.
//!
//! All mutations of the broadcaster slot, listener set, cached init segment,
//! and the `active`/`torn_down` flags are serialized through a single
//! per-session `tokio::sync::Mutex`, matching the "per-session single-writer"
//! model described for this system.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::info;

use relay_api::TeardownReason;
use relay_core::{new_session_id, new_session_token, RelayError, SessionError};

use crate::config::Config;
use crate::recording::RecordingSink;
use crate::relay_hub::RelayHub;

/// Commands delivered to the broadcaster socket task.
#[derive(Debug, Clone)]
pub enum BroadcasterCommand {
    Backpressure,
    Drain,
    ListenerCount(usize),
    Error(String),
    Close,
}

/// Commands delivered to a listener socket task.
#[derive(Debug, Clone)]
pub enum ListenerCommand {
    BroadcastStarted,
    SessionEnded(TeardownReason),
    Close,
}

pub type BroadcasterSender = mpsc::UnboundedSender<BroadcasterCommand>;
pub type ListenerSender = mpsc::UnboundedSender<ListenerCommand>;

struct ListenerHandle {
    id: u64,
    cmd_tx: ListenerSender,
}

struct SessionInner {
    active: bool,
    torn_down: bool,
    broadcaster: Option<BroadcasterSender>,
    listeners: Vec<ListenerHandle>,
    init_segment: Option<Bytes>,
    backpressure_latched: bool,
}

/// Aggregate state for one live broadcast.
pub struct Session {
    pub id: String,
    pub token: String,
    /// Milliseconds since the Unix epoch; part of the recording filename
    /// and the basis for the `expiresAt` value returned on creation.
    pub created_at_ms: u128,
    pub ttl_ms: u64,
    max_listeners: usize,
    inner: Mutex<SessionInner>,
    hub: RelayHub,
    recording: RecordingSink,
    store: Weak<SessionStore>,
    next_listener_id: AtomicU64,
    expiry_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
    /// Attempts to attach the broadcaster socket. Fails if one is already
    /// attached or the session has already ended.
    pub async fn attach_broadcaster(&self, cmd_tx: BroadcasterSender) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        if !inner.active {
            return Err(SessionError::SessionNotLive);
        }
        if inner.broadcaster.is_some() {
            return Err(SessionError::BroadcasterAlreadyPresent);
        }
        inner.broadcaster = Some(cmd_tx);
        for listener in &inner.listeners {
            let _ = listener.cmd_tx.send(ListenerCommand::BroadcastStarted);
        }
        Ok(())
    }

    /// Attaches a new listener, returning its id, a subscription to the
    /// relay's fan-out channel, a snapshot of the cached init segment (if
    /// any, taken atomically with the subscription so no live chunk can be
    /// missed or duplicated around the attach point), and whether a
    /// broadcaster is already live. The caller -- not this method -- is
    /// responsible for telling the socket about an already-live broadcaster,
    /// since it must do so *before* delivering the cached init segment; a
    /// queued [`ListenerCommand::BroadcastStarted`] would instead surface
    /// after the socket has already sent it.
    pub async fn attach_listener(
        &self,
        cmd_tx: ListenerSender,
    ) -> Result<(u64, broadcast::Receiver<Bytes>, Option<Bytes>, bool), SessionError> {
        let mut inner = self.inner.lock().await;
        if !inner.active {
            return Err(SessionError::SessionNotLive);
        }
        if inner.listeners.len() >= self.max_listeners {
            return Err(SessionError::CapacityExceeded);
        }

        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.hub.subscribe();
        let cached_init = inner.init_segment.clone();
        let broadcast_already_live = inner.broadcaster.is_some();

        inner.listeners.push(ListenerHandle { id, cmd_tx });
        let count = inner.listeners.len();
        drop(inner);

        self.notify_listener_count(count).await;

        Ok((id, rx, cached_init, broadcast_already_live))
    }

    /// Detaches a listener by id. A no-op if it was already removed (e.g.
    /// by a concurrent teardown).
    pub async fn detach_listener(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        inner.listeners.retain(|l| l.id != id);
        let count = inner.listeners.len();
        drop(inner);
        self.notify_listener_count(count).await;
    }

    async fn notify_listener_count(&self, count: usize) {
        let inner = self.inner.lock().await;
        if let Some(tx) = &inner.broadcaster {
            let _ = tx.send(BroadcasterCommand::ListenerCount(count));
        }
    }

    /// Entry point for a binary chunk from the broadcaster: caches the init
    /// segment on first arrival, fans it out to listeners, tees it to the
    /// recording, and manages the backpressure latch.
    ///
    /// Caching the init segment and publishing to the hub happen under the
    /// same lock section that `attach_listener` takes its subscription and
    /// init-segment snapshot under, so a listener attaching concurrently can
    /// never both capture a chunk as `cached_init` and also receive it again
    /// through its fresh subscription.
    pub async fn forward(self: &Arc<Self>, chunk: Bytes) {
        let mut inner = self.inner.lock().await;
        if !inner.active {
            return;
        }
        if inner.init_segment.is_none() {
            inner.init_segment = Some(chunk.clone());
        }
        self.hub.publish(chunk.clone());
        drop(inner);

        let accepted = self.recording.write(chunk);

        if accepted {
            return;
        }

        let mut inner = self.inner.lock().await;
        let already_latched = inner.backpressure_latched;
        inner.backpressure_latched = true;
        let broadcaster_tx = inner.broadcaster.clone();
        drop(inner);

        if already_latched {
            return;
        }

        if let Some(tx) = &broadcaster_tx {
            let _ = tx.send(BroadcasterCommand::Backpressure);
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.recording.wait_drain().await;
            let mut inner = session.inner.lock().await;
            inner.backpressure_latched = false;
            let tx = inner.broadcaster.clone();
            drop(inner);
            if let Some(tx) = tx {
                let _ = tx.send(BroadcasterCommand::Drain);
            }
        });
    }

    /// Idempotent teardown. Safe to invoke concurrently or more than once;
    /// only the first caller performs the procedure.
    pub async fn teardown(self: &Arc<Self>, reason: TeardownReason) {
        let mut inner = self.inner.lock().await;
        if inner.torn_down {
            return;
        }
        inner.torn_down = true;
        inner.active = false;

        if let Some(handle) = self.expiry_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }

        if let Some(tx) = inner.broadcaster.take() {
            let _ = tx.send(BroadcasterCommand::Close);
        }

        let listeners = std::mem::take(&mut inner.listeners);
        drop(inner);

        for listener in listeners {
            let _ = listener.cmd_tx.send(ListenerCommand::SessionEnded(reason));
            let _ = listener.cmd_tx.send(ListenerCommand::Close);
        }

        self.recording.close().await;

        if let Some(store) = self.store.upgrade() {
            store.remove(&self.id).await;
        }

        info!(session_id = %self.id, reason = reason.as_str(), "session torn down");
    }

    pub fn recording_path(&self) -> &std::path::Path {
        self.recording.path()
    }

    pub fn max_listeners(&self) -> usize {
        self.max_listeners
    }

    pub async fn listener_count(&self) -> usize {
        self.inner.lock().await.listeners.len()
    }

    /// RFC 3339 formatted expiry instant, for the session-create response.
    pub fn expires_at_rfc3339(&self) -> String {
        use time::format_description::well_known::Rfc3339;

        #[allow(clippy::cast_possible_wrap)]
        let created_at_nanos = (self.created_at_ms * 1_000_000) as i128;
        let ttl_nanos = i128::from(self.ttl_ms) * 1_000_000;

        time::OffsetDateTime::from_unix_timestamp_nanos(created_at_nanos + ttl_nanos)
            .map(|dt| dt.format(&Rfc3339).unwrap_or_default())
            .unwrap_or_default()
    }
}

fn current_unix_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

struct SessionMetrics {
    active_gauge: opentelemetry::metrics::Gauge<u64>,
    created_counter: opentelemetry::metrics::Counter<u64>,
    destroyed_counter: opentelemetry::metrics::Counter<u64>,
    duration_histogram: opentelemetry::metrics::Histogram<f64>,
}

impl SessionMetrics {
    fn shared() -> &'static Self {
        static METRICS: std::sync::OnceLock<SessionMetrics> = std::sync::OnceLock::new();
        METRICS.get_or_init(|| {
            let meter = opentelemetry::global::meter("relay_sessions");
            Self {
                active_gauge: meter.u64_gauge("relay_sessions_active").build(),
                created_counter: meter.u64_counter("relay_sessions_created_total").build(),
                destroyed_counter: meter.u64_counter("relay_sessions_destroyed_total").build(),
                duration_histogram: meter.f64_histogram("relay_session_duration_seconds").build(),
            }
        })
    }
}

/// Process-wide registry mapping session id to live `Session`.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    config: Arc<Config>,
}

impl SessionStore {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self { sessions: Mutex::new(HashMap::new()), config })
    }

    /// Allocates a new session: id and token, an open recording sink, and a
    /// scheduled expiry teardown. Never returns an id collision.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Recording`] if the recording file cannot be
    /// opened.
    pub async fn create(self: &Arc<Self>) -> Result<Arc<Session>, RelayError> {
        let mut sessions = self.sessions.lock().await;

        let id = loop {
            let candidate = new_session_id();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let token = new_session_token();

        let created_at_ms = current_unix_millis();
        let recording_path = std::path::Path::new(&self.config.recordings.dir)
            .join(format!("broadcast-{id}-{created_at_ms}.webm"));
        let recording = RecordingSink::open(&recording_path).await?;

        let session = Arc::new(Session {
            id: id.clone(),
            token,
            created_at_ms,
            ttl_ms: self.config.session.ttl_ms,
            max_listeners: self.config.session.max_listeners,
            inner: Mutex::new(SessionInner {
                active: true,
                torn_down: false,
                broadcaster: None,
                listeners: Vec::new(),
                init_segment: None,
                backpressure_latched: false,
            }),
            hub: RelayHub::new(),
            recording,
            store: Arc::downgrade(self),
            next_listener_id: AtomicU64::new(0),
            expiry_handle: std::sync::Mutex::new(None),
        });

        let timer_session = Arc::clone(&session);
        let ttl = Duration::from_millis(self.config.session.ttl_ms);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            timer_session.teardown(TeardownReason::Expired).await;
        });
        *session.expiry_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        sessions.insert(id.clone(), Arc::clone(&session));
        let active_count = sessions.len() as u64;
        drop(sessions);

        let metrics = SessionMetrics::shared();
        metrics.created_counter.add(1, &[]);
        metrics.active_gauge.record(active_count, &[]);

        info!(session_id = %session.id, "session created");

        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Removes a session from the registry. Idempotent.
    pub async fn remove(&self, id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.remove(id) {
            let active_count = sessions.len() as u64;
            drop(sessions);

            let metrics = SessionMetrics::shared();
            metrics.destroyed_counter.add(1, &[]);
            metrics.active_gauge.record(active_count, &[]);

            let lifetime_ms = current_unix_millis().saturating_sub(session.created_at_ms);
            #[allow(clippy::cast_precision_loss)]
            metrics.duration_histogram.record(lifetime_ms as f64 / 1000.0, &[]);
        }
    }

    /// Tears down every currently live session. Called on process shutdown.
    pub async fn teardown_all(&self, reason: TeardownReason) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            session.teardown(reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> Arc<Config> {
        let mut config = Config::default();
        config.recordings.dir = dir.to_string_lossy().into_owned();
        config.session.ttl_ms = 60_000;
        config.session.max_listeners = 2;
        Arc::new(config)
    }

    #[tokio::test]
    async fn create_allocates_distinct_id_and_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(test_config(dir.path()));

        let a = store.create().await.unwrap();
        let b = store.create().await.unwrap();

        assert_ne!(a.id, b.id);
        assert_ne!(a.token, b.token);
        assert_eq!(a.id.len(), 8);
        assert_eq!(a.token.len(), 32);
    }

    #[tokio::test]
    async fn get_after_remove_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(test_config(dir.path()));

        let session = store.create().await.unwrap();
        assert!(store.get(&session.id).await.is_some());

        store.remove(&session.id).await;
        assert!(store.get(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn second_broadcaster_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(test_config(dir.path()));
        let session = store.create().await.unwrap();

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        session.attach_broadcaster(tx1).await.unwrap();
        let err = session.attach_broadcaster(tx2).await.unwrap_err();
        assert!(matches!(err, SessionError::BroadcasterAlreadyPresent));
    }

    #[tokio::test]
    async fn listener_capacity_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(test_config(dir.path()));
        let session = store.create().await.unwrap();

        for _ in 0..2 {
            let (tx, _rx) = mpsc::unbounded_channel();
            session.attach_listener(tx).await.unwrap();
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = session.attach_listener(tx).await.unwrap_err();
        assert!(matches!(err, SessionError::CapacityExceeded));
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_removes_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(test_config(dir.path()));
        let session = store.create().await.unwrap();

        session.teardown(TeardownReason::Expired).await;
        session.teardown(TeardownReason::Expired).await;

        assert!(store.get(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn forward_after_teardown_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(test_config(dir.path()));
        let session = store.create().await.unwrap();

        session.teardown(TeardownReason::Expired).await;
        session.forward(Bytes::from_static(b"late")).await;
        // No panic, no reactivation: the forward call is simply ignored.
    }

    #[tokio::test]
    async fn late_joiner_sees_cached_init_segment() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(test_config(dir.path()));
        let session = store.create().await.unwrap();

        let (btx, _brx) = mpsc::unbounded_channel();
        session.attach_broadcaster(btx).await.unwrap();
        session.forward(Bytes::from_static(b"B1")).await;
        session.forward(Bytes::from_static(b"B2")).await;

        let (ltx, _lrx) = mpsc::unbounded_channel();
        let (_, _rx, cached_init, broadcast_already_live) = session.attach_listener(ltx).await.unwrap();
        assert_eq!(cached_init, Some(Bytes::from_static(b"B1")));
        assert!(broadcast_already_live);
    }
}
