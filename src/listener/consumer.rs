//! Queue consumer loop
//!
//! Pops one entry at a time from a channel, parses it and hands it to a
//! synchronous callback. The callback is expected to spawn any real work,
//! so the next pop is issued as soon as the previous entry is handed off.

use super::gate::wait_for_shutdown;
use crate::observability::metrics::metrics;
use crate::queue::{JobQueue, QueueError, QueueReply};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// Why a consumer loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    Shutdown,
    /// The queue reported it will never deliver again
    QueueClosed,
}

/// Blocking consumer for a single channel
pub struct QueueConsumer {
    platform: String,
    channel: String,
    queue: Arc<dyn JobQueue>,
    retry_delay: Duration,
}

impl QueueConsumer {
    pub fn new(
        platform: &str,
        channel: &str,
        queue: Arc<dyn JobQueue>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            platform: platform.to_string(),
            channel: channel.to_string(),
            queue,
            retry_delay,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Consume until shutdown or until the queue closes
    ///
    /// Missing and unparseable entries are logged and skipped.
    pub async fn run<T, F>(&self, mut shutdown: watch::Receiver<bool>, mut handle: F) -> ConsumerExit
    where
        T: DeserializeOwned,
        F: FnMut(T),
    {
        let span = crate::queue_span!(platform = %self.platform, channel = %self.channel);
        async {
            info!("Queueing for entries");
            loop {
                let popped = tokio::select! {
                    popped = self.queue.blocking_pop(&self.channel) => popped,
                    _ = wait_for_shutdown(&mut shutdown) => return ConsumerExit::Shutdown,
                };

                match popped {
                    Ok(reply) => {
                        if let Some(entry) = self.parse::<T>(reply) {
                            handle(entry);
                        }
                    }
                    Err(QueueError::Closed) => {
                        info!("Queue closed, consumer stopping");
                        return ConsumerExit::QueueClosed;
                    }
                    Err(e) => {
                        metrics().queue_error();
                        error!(error = %e, "Error popping from queue");
                        tokio::select! {
                            _ = tokio::time::sleep(self.retry_delay) => {}
                            _ = wait_for_shutdown(&mut shutdown) => return ConsumerExit::Shutdown,
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    fn parse<T: DeserializeOwned>(&self, reply: QueueReply) -> Option<T> {
        let Some(payload) = reply.payload else {
            metrics().job_malformed();
            warn!("Queue returned an invalid result, skipping");
            return None;
        };

        match serde_json::from_slice(&payload) {
            Ok(entry) => {
                debug!(bytes = payload.len(), "Received entry");
                Some(entry)
            }
            Err(e) => {
                metrics().job_malformed();
                warn!(error = %e, "Failed to parse queue entry, discarding");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Job;
    use crate::queue::MemoryQueue;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_skips_malformed_and_keeps_consuming() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push("in", b"not json".to_vec()).await.unwrap();
        queue.push_missing("in").unwrap();
        queue
            .push("in", br#"{"sessionId":"s1","verb":"send","object":{}}"#.to_vec())
            .await
            .unwrap();

        let consumer = QueueConsumer::new("mock", "in", queue.clone(), Duration::from_millis(5));
        let (tx, rx) = watch::channel(false);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();

        let task = tokio::spawn(async move {
            consumer
                .run(rx, move |job: Job| {
                    sink.lock().unwrap().push(job);
                    let _ = tx.send(true);
                })
                .await
        });

        let exit = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ConsumerExit::Shutdown);
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].session_id(), Some("s1"));
    }

    #[tokio::test]
    async fn test_stops_when_queue_closes() {
        let queue = Arc::new(MemoryQueue::new());
        let consumer = QueueConsumer::new("mock", "in", queue.clone(), Duration::from_millis(5));
        let (_tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move { consumer.run(rx, |_: Job| {}).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await;

        let exit = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ConsumerExit::QueueClosed);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocking_pop() {
        let queue = Arc::new(MemoryQueue::new());
        let consumer = QueueConsumer::new("mock", "in", queue, Duration::from_millis(5));
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move { consumer.run(rx, |_: Job| {}).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ConsumerExit::Shutdown);
    }
}
