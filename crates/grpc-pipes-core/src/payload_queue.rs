//! Ordered buffer between the read loop and a message consumer.
//!
//! The read loop is the only producer and one reader is the only consumer.
//! Chunks come out in the order they were appended; end-of-stream is only
//! reported once every appended chunk has been drained.

use crate::cancel::CancelledError;
use crate::error::{Result, TransportError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueState {
    chunks: VecDeque<Bytes>,
    completed: bool,
    disposed: bool,
}

/// Payload chunks plus a completion flag.
#[derive(Debug, Default)]
pub struct PayloadQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl PayloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk.
    ///
    /// Appending after [`set_completed`](Self::set_completed) is a protocol
    /// violation and fails. Chunks arriving after disposal are dropped.
    pub fn append_payload(&self, payload: Bytes) -> Result<()> {
        {
            let mut state = self.lock();
            if state.disposed {
                return Ok(());
            }
            if state.completed {
                return Err(TransportError::PayloadAfterStreamEnd);
            }
            state.chunks.push_back(payload);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Mark end-of-stream. Idempotent.
    pub fn set_completed(&self) {
        self.lock().completed = true;
        self.notify.notify_one();
    }

    /// Abandon the queue: drop buffered chunks and release any waiting consumer.
    pub fn dispose(&self) {
        {
            let mut state = self.lock();
            state.disposed = true;
            state.chunks.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    /// Next chunk in append order.
    ///
    /// Suspends while the queue is empty and open. Returns `Ok(None)` once the
    /// queue is drained and completed, and `Err(CancelledError)` once disposed.
    pub async fn next(&self) -> std::result::Result<Option<Bytes>, CancelledError> {
        loop {
            {
                let mut state = self.lock();
                if state.disposed {
                    return Err(CancelledError);
                }
                if let Some(chunk) = state.chunks.pop_front() {
                    return Ok(Some(chunk));
                }
                if state.completed {
                    return Ok(None);
                }
            }
            // notify_one stores a permit, so a wake-up between the check
            // above and this await is not lost.
            self.notify.notified().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // The state stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
