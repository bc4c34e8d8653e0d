// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `RelayHub`: the per-session broadcaster→listeners fan-out mechanism.
//!
//! Built directly on [`tokio::sync::broadcast`], whose fixed-depth ring
//! buffer already implements the drop-oldest overflow policy the relay
//! wants: once the channel is full, the oldest unread chunk is evicted and
//! any receiver that hadn't read it yet observes `RecvError::Lagged` on its
//! next `recv()`, without that receiver ever blocking delivery to others.

use bytes::Bytes;
use tokio::sync::broadcast;

/// Per-listener outbound queue depth, in chunks (suggested by the relay
/// contract as "32 chunks or ~4s of audio, whichever is smaller").
pub const LISTENER_QUEUE_DEPTH: usize = 32;

/// A listener that falls behind this many times in a row, without ever
/// catching back up to a clean delivery, is disconnected as a slow
/// consumer rather than left lagging indefinitely.
pub const MAX_CONSECUTIVE_LAG_EVENTS: u32 = 3;

/// Per-session fan-out channel for binary broadcast chunks.
pub struct RelayHub {
    tx: broadcast::Sender<Bytes>,
}

impl RelayHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(LISTENER_QUEUE_DEPTH);
        Self { tx }
    }

    /// Publishes a chunk to every current subscriber. A send error just
    /// means there are currently no listeners, which is not a failure.
    pub fn publish(&self, chunk: Bytes) {
        let _ = self.tx.send(chunk);
    }

    /// Subscribes a new listener. Only chunks published after this call are
    /// visible to the returned receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

/// What a listener task should do after observing a `Lagged` error on its
/// subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LagOutcome {
    /// Keep relaying; the consecutive-lag count has not crossed the limit.
    Continue,
    /// Disconnect the listener with reason `slow-consumer`.
    Disconnect,
}

/// Tracks consecutive overflow events for a single listener subscription.
#[derive(Debug, Default)]
pub struct LagTracker {
    consecutive: u32,
}

impl LagTracker {
    pub fn record_lag(&mut self) -> LagOutcome {
        self.consecutive += 1;
        if self.consecutive >= MAX_CONSECUTIVE_LAG_EVENTS {
            LagOutcome::Disconnect
        } else {
            LagOutcome::Continue
        }
    }

    pub fn record_delivery(&mut self) {
        self.consecutive = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_only_sees_future_chunks() {
        let hub = RelayHub::new();
        hub.publish(Bytes::from_static(b"before"));

        let mut rx = hub.subscribe();
        hub.publish(Bytes::from_static(b"after"));

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"after"));
    }

    #[tokio::test]
    async fn a_slow_listener_does_not_block_a_fast_one() {
        let hub = RelayHub::new();
        let mut fast = hub.subscribe();
        let _slow = hub.subscribe();

        hub.publish(Bytes::from_static(b"c1"));
        hub.publish(Bytes::from_static(b"c2"));

        assert_eq!(fast.recv().await.unwrap(), Bytes::from_static(b"c1"));
        assert_eq!(fast.recv().await.unwrap(), Bytes::from_static(b"c2"));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_reports_lag() {
        let hub = RelayHub::new();
        let mut rx = hub.subscribe();

        for i in 0..(LISTENER_QUEUE_DEPTH + 5) {
            hub.publish(Bytes::from(i.to_string()));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped > 0),
            other => panic!("expected Lagged, got {other:?}"),
        }
    }

    #[test]
    fn lag_tracker_disconnects_after_consecutive_threshold() {
        let mut tracker = LagTracker::default();
        assert_eq!(tracker.record_lag(), LagOutcome::Continue);
        assert_eq!(tracker.record_lag(), LagOutcome::Continue);
        assert_eq!(tracker.record_lag(), LagOutcome::Disconnect);
    }

    #[test]
    fn lag_tracker_resets_on_clean_delivery() {
        let mut tracker = LagTracker::default();
        tracker.record_lag();
        tracker.record_lag();
        tracker.record_delivery();
        assert_eq!(tracker.record_lag(), LagOutcome::Continue);
    }
}
