//! In-process queue backend
//!
//! Used when `queue.backend = "memory"` and throughout the test suite.
//! Each channel is an unbounded mpsc pair; a pop holds the receiver lock for
//! the duration of the wait so concurrent pops on one channel are served in
//! order.

use super::{JobQueue, QueueError, QueueReply};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

type Entry = Option<Vec<u8>>;

struct Channel {
    tx: mpsc::UnboundedSender<Entry>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Entry>>>,
}

impl Channel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }
}

/// Queue whose channels live in process memory
#[derive(Default)]
pub struct MemoryQueue {
    channels: Mutex<HashMap<String, Channel>>,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_channel<R>(
        &self,
        channel: &str,
        f: impl FnOnce(&Channel) -> R,
    ) -> Result<R, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let mut channels = self.channels.lock().map_err(|_| QueueError::Closed)?;
        let entry = channels
            .entry(channel.to_string())
            .or_insert_with(Channel::new);
        Ok(f(entry))
    }

    fn send(&self, channel: &str, entry: Entry) -> Result<(), QueueError> {
        self.with_channel(channel, |ch| ch.tx.send(entry))?
            .map_err(|_| QueueError::Closed)
    }

    /// Enqueue a reply that carries no entry
    pub fn push_missing(&self, channel: &str) -> Result<(), QueueError> {
        self.send(channel, None)
    }

    /// Take the next payload without waiting
    pub fn try_pop(&self, channel: &str) -> Option<Vec<u8>> {
        let rx = self.with_channel(channel, |ch| ch.rx.clone()).ok()?;
        let mut guard = rx.try_lock().ok()?;
        guard.try_recv().ok().flatten()
    }

    /// Wait at most `timeout` for the next payload on `channel`
    pub async fn pop_timeout(&self, channel: &str, timeout: Duration) -> Option<Vec<u8>> {
        match tokio::time::timeout(timeout, self.blocking_pop(channel)).await {
            Ok(Ok(reply)) => reply.payload,
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn blocking_pop(&self, channel: &str) -> Result<QueueReply, QueueError> {
        let rx = self.with_channel(channel, |ch| ch.rx.clone())?;
        let mut guard = rx.lock().await;
        match guard.recv().await {
            Some(payload) => Ok(QueueReply {
                channel: channel.to_string(),
                payload,
            }),
            None => Err(QueueError::Closed),
        }
    }

    async fn push(&self, channel: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        self.send(channel, Some(payload))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes every waiting pop with `None`
        if let Ok(mut channels) = self.channels.lock() {
            debug!(channels = channels.len(), "Closing memory queue");
            channels.clear();
        }
    }
}
