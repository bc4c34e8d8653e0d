// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `RecordingSink`: a sequential, non-blocking writer of the raw broadcast
//! byte stream to a single append-mode file.
//!
//! Chunks are hand off to a dedicated writer task over an unbounded channel
//! so `write()` never blocks the relay's hot path; `pending_bytes` tracks
//! how much is queued so callers can derive a backpressure signal without
//! the writer task itself ever dropping a chunk.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Notify};
use tracing::{error, warn};

use relay_core::RecordingError;

/// Above this many pending bytes, `write()` reports the sink as not
/// accepting more (the producer should pause).
const DEFAULT_HIGH_WATER: usize = 4 * 1024 * 1024;
/// Below this many pending bytes, a previously-latched backpressure signal
/// is considered drained.
const DEFAULT_LOW_WATER: usize = 1024 * 1024;

struct SinkInner {
    tx: mpsc::UnboundedSender<Bytes>,
    pending_bytes: AtomicUsize,
    drain_notify: Notify,
    high_water: usize,
    low_water: usize,
    path: PathBuf,
    closed: AtomicBool,
    done: AtomicBool,
    done_notify: Notify,
    stop_notify: Notify,
}

/// Append-only, per-session recording writer.
#[derive(Clone)]
pub struct RecordingSink {
    inner: Arc<SinkInner>,
}

impl RecordingSink {
    /// Opens (creating if necessary) the file at `path` in append mode and
    /// spawns its writer task.
    ///
    /// # Errors
    ///
    /// Returns [`RecordingError::Io`] if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RecordingError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SinkInner {
            tx,
            pending_bytes: AtomicUsize::new(0),
            drain_notify: Notify::new(),
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            path: path.clone(),
            closed: AtomicBool::new(false),
            done: AtomicBool::new(false),
            done_notify: Notify::new(),
            stop_notify: Notify::new(),
        });

        tokio::spawn(run_writer(file, rx, Arc::clone(&inner)));

        Ok(Self { inner })
    }

    /// Appends `bytes` to the write queue. Never blocks.
    ///
    /// Returns `true` if the queue is below the high-water mark (the
    /// producer may continue at full rate), `false` otherwise.
    pub fn write(&self, bytes: Bytes) -> bool {
        let len = bytes.len();
        let pending = self.inner.pending_bytes.fetch_add(len, Ordering::AcqRel) + len;

        if self.inner.tx.send(bytes).is_err() {
            warn!(path = %self.inner.path.display(), "recording writer task is gone; dropping chunk");
        }

        pending <= self.inner.high_water
    }

    /// Resolves once the pending queue has drained below the low-water mark.
    /// Re-armable: may be called again after a subsequent backpressure
    /// episode.
    pub async fn wait_drain(&self) {
        loop {
            let notified = self.inner.drain_notify.notified();
            tokio::pin!(notified);
            // Enable before the flag check: otherwise a writer task can flip
            // `pending_bytes` and notify in the window between the check and
            // `notified.await` registering, and the wakeup is lost forever.
            notified.as_mut().enable();
            if self.inner.pending_bytes.load(Ordering::Acquire) <= self.inner.low_water {
                return;
            }
            notified.await;
        }
    }

    /// Flushes pending bytes and releases the file. Idempotent: safe to call
    /// more than once, from more than one caller.
    pub async fn close(&self) {
        let already_closing = self.inner.closed.swap(true, Ordering::AcqRel);
        if !already_closing {
            self.inner.stop_notify.notify_one();
        }

        loop {
            let notified = self.inner.done_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.done.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

async fn run_writer(
    mut file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    inner: Arc<SinkInner>,
) {
    loop {
        tokio::select! {
            biased;
            () = inner.stop_notify.notified() => {
                while let Ok(bytes) = rx.try_recv() {
                    write_chunk(&mut file, &bytes, &inner).await;
                }
                break;
            }
            maybe_bytes = rx.recv() => {
                match maybe_bytes {
                    Some(bytes) => write_chunk(&mut file, &bytes, &inner).await,
                    None => break,
                }
            }
        }
    }

    if let Err(e) = file.flush().await {
        error!(path = %inner.path.display(), error = %e, "failed to flush recording file");
    }

    inner.done.store(true, Ordering::Release);
    inner.done_notify.notify_waiters();
}

async fn write_chunk(file: &mut tokio::fs::File, bytes: &Bytes, inner: &SinkInner) {
    if let Err(e) = file.write_all(bytes).await {
        error!(path = %inner.path.display(), error = %e, "recording write failed; continuing relay");
    }

    let len = bytes.len();
    let pending = inner.pending_bytes.fetch_sub(len, Ordering::AcqRel) - len;
    if pending <= inner.low_water {
        inner.drain_notify.notify_waiters();
    }
}
