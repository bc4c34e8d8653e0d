// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-role WebSocket socket loops, spun up after [`crate::upgrade_gate`]
//! has already admitted the connection and the caller has attached it to a
//! [`Session`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use opentelemetry::{global, KeyValue};
use serde::Serialize;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{info, warn};

use relay_api::{BroadcasterFrame, ListenerFrame, TeardownReason};

use crate::relay_hub::{LagOutcome, LagTracker};
use crate::session::{BroadcasterCommand, ListenerCommand, Session};

static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
struct WebSocketMetrics {
    connections_gauge: opentelemetry::metrics::Gauge<u64>,
    messages_counter: opentelemetry::metrics::Counter<u64>,
    errors_counter: opentelemetry::metrics::Counter<u64>,
}

impl WebSocketMetrics {
    fn shared() -> Self {
        static METRICS: OnceLock<WebSocketMetrics> = OnceLock::new();
        METRICS
            .get_or_init(|| {
                let meter = global::meter("relay_websocket");
                Self {
                    connections_gauge: meter
                        .u64_gauge("websocket.connections.active")
                        .with_description("Number of active WebSocket connections")
                        .build(),
                    messages_counter: meter
                        .u64_counter("websocket.messages")
                        .with_description("Total WebSocket messages")
                        .build(),
                    errors_counter: meter
                        .u64_counter("websocket.errors")
                        .with_description("WebSocket errors")
                        .build(),
                }
            })
            .clone()
    }
}

async fn send_json<T: Serialize + Sync>(socket: &mut WebSocket, message: &T) -> Result<(), ()> {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json.into())).await.map_err(|_| ()),
        Err(e) => {
            warn!(error = %e, "failed to serialize WebSocket frame");
            Err(())
        }
    }
}

fn broadcaster_frame_for(command: BroadcasterCommand) -> Option<(BroadcasterFrame, bool)> {
    match command {
        BroadcasterCommand::Backpressure => Some((BroadcasterFrame::Backpressure, false)),
        BroadcasterCommand::Drain => Some((BroadcasterFrame::Drain, false)),
        BroadcasterCommand::ListenerCount(count) => {
            Some((BroadcasterFrame::ListenerCount { count }, false))
        }
        BroadcasterCommand::Error(message) => Some((BroadcasterFrame::Error { message }, true)),
        BroadcasterCommand::Close => None,
    }
}

/// Drives a broadcaster's socket: binary frames are forwarded into the
/// session, and commands from the session (backpressure, listener counts,
/// fatal errors) are translated into outbound text frames.
pub async fn handle_broadcaster_socket(
    mut socket: WebSocket,
    session: Arc<Session>,
    mut cmd_rx: mpsc::UnboundedReceiver<BroadcasterCommand>,
) {
    info!(session_id = %session.id, "broadcaster connected");
    let metrics = WebSocketMetrics::shared();
    let active = ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
    metrics.connections_gauge.record(active, &[]);

    loop {
        tokio::select! {
            maybe_msg = socket.recv() => {
                let Some(msg) = maybe_msg else { break };
                match msg {
                    Ok(Message::Binary(data)) => {
                        metrics.messages_counter.add(1, &[KeyValue::new("direction", "inbound")]);
                        session.forward(Bytes::from(data)).await;
                    }
                    Ok(Message::Close(_)) => {
                        info!(session_id = %session.id, "broadcaster closed connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(session_id = %session.id, error = %e, "broadcaster socket error");
                        metrics.errors_counter.add(1, &[KeyValue::new("error_type", "connection_error")]);
                        break;
                    }
                }
            }
            command = cmd_rx.recv() => {
                let Some(command) = command else { break };
                if matches!(command, BroadcasterCommand::Close) {
                    break;
                }
                if let Some((frame, is_fatal)) = broadcaster_frame_for(command) {
                    metrics.messages_counter.add(1, &[KeyValue::new("direction", "outbound")]);
                    if send_json(&mut socket, &frame).await.is_err() {
                        break;
                    }
                    if is_fatal {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    session.teardown(TeardownReason::BroadcasterDisconnected).await;

    let prev = ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    metrics.connections_gauge.record(prev.saturating_sub(1), &[]);
    info!(session_id = %session.id, "broadcaster connection terminated");
}

/// Drives a listener's socket: an already-live broadcaster is announced
/// before the cached (or not-yet-arrived) init segment is delivered, then
/// every subsequent live chunk follows, while watching for lag severe
/// enough to warrant disconnecting a slow consumer.
pub async fn handle_listener_socket(
    mut socket: WebSocket,
    session: Arc<Session>,
    listener_id: u64,
    mut chunk_rx: tokio::sync::broadcast::Receiver<Bytes>,
    cached_init: Option<Bytes>,
    broadcast_already_live: bool,
    mut cmd_rx: mpsc::UnboundedReceiver<ListenerCommand>,
) {
    info!(session_id = %session.id, listener_id, "listener connected");
    let metrics = WebSocketMetrics::shared();
    let active = ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
    metrics.connections_gauge.record(active, &[]);

    let ok_frame = ListenerFrame::Ok { session_id: session.id.clone() };
    if send_json(&mut socket, &ok_frame).await.is_err() {
        session.detach_listener(listener_id).await;
        return;
    }

    if broadcast_already_live {
        metrics.messages_counter.add(1, &[KeyValue::new("direction", "outbound")]);
        if send_json(&mut socket, &ListenerFrame::BroadcastStarted).await.is_err() {
            session.detach_listener(listener_id).await;
            return;
        }
    }

    let mut has_sent_init = false;
    if let Some(init_segment) = cached_init {
        if !deliver_chunk(&mut socket, &init_segment, &mut has_sent_init, &metrics).await {
            session.detach_listener(listener_id).await;
            return;
        }
    }

    let mut lag_tracker = LagTracker::default();

    loop {
        tokio::select! {
            maybe_msg = socket.recv() => {
                match maybe_msg {
                    None | Some(Ok(Message::Close(_))) => {
                        info!(session_id = %session.id, listener_id, "listener closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session.id, listener_id, error = %e, "listener socket error");
                        metrics.errors_counter.add(1, &[KeyValue::new("error_type", "connection_error")]);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            chunk_result = chunk_rx.recv() => {
                match chunk_result {
                    Ok(chunk) => {
                        lag_tracker.record_delivery();
                        if !deliver_chunk(&mut socket, &chunk, &mut has_sent_init, &metrics).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session_id = %session.id, listener_id, skipped, "listener lagged");
                        metrics.errors_counter.add(1, &[KeyValue::new("error_type", "recv_lagged")]);
                        if lag_tracker.record_lag() == LagOutcome::Disconnect {
                            warn!(session_id = %session.id, listener_id, "disconnecting slow listener");
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            command = cmd_rx.recv() => {
                match command {
                    Some(ListenerCommand::BroadcastStarted) => {
                        metrics.messages_counter.add(1, &[KeyValue::new("direction", "outbound")]);
                        if send_json(&mut socket, &ListenerFrame::BroadcastStarted).await.is_err() {
                            break;
                        }
                    }
                    Some(ListenerCommand::SessionEnded(reason)) => {
                        let frame = ListenerFrame::SessionEnded { reason };
                        let _ = send_json(&mut socket, &frame).await;
                    }
                    Some(ListenerCommand::Close) | None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    session.detach_listener(listener_id).await;

    let prev = ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    metrics.connections_gauge.record(prev.saturating_sub(1), &[]);
    info!(session_id = %session.id, listener_id, "listener connection terminated");
}

async fn deliver_chunk(
    socket: &mut WebSocket,
    chunk: &Bytes,
    has_sent_init: &mut bool,
    metrics: &WebSocketMetrics,
) -> bool {
    if !*has_sent_init {
        *has_sent_init = true;
        let frame = ListenerFrame::InitSegment { size: chunk.len() };
        metrics.messages_counter.add(1, &[KeyValue::new("direction", "outbound")]);
        if send_json(socket, &frame).await.is_err() {
            return false;
        }
    }

    metrics.messages_counter.add(1, &[KeyValue::new("direction", "outbound")]);
    socket.send(Message::Binary(chunk.clone())).await.is_ok()
}
