//! Work queue abstraction consumed by the listener
//!
//! A listener blocks on two named channels (incoming jobs and subsystem
//! control messages) and pushes job reports to per-session outgoing
//! channels. The `JobQueue` trait hides whether those channels live on an
//! MQTT broker or in process memory.

pub mod memory;
pub mod mqtt;

pub use memory::MemoryQueue;
pub use mqtt::{MqttError, MqttQueue};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// One entry taken from a channel
///
/// `payload` is `None` when the backend answered the pop without an entry,
/// which the consumer treats as an invalid result and skips.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueReply {
    pub channel: String,
    pub payload: Option<Vec<u8>>,
}

/// Errors raised by queue backends
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue closed")]
    Closed,
    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// The backend will never deliver again; consumers should stop
    pub fn is_closed(&self) -> bool {
        matches!(self, QueueError::Closed)
    }
}

/// Blocking work queue keyed by channel name
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Wait until an entry is available on `channel` and take it
    async fn blocking_pop(&self, channel: &str) -> Result<QueueReply, QueueError>;

    /// Append a payload to `channel`
    async fn push(&self, channel: &str, payload: Vec<u8>) -> Result<(), QueueError>;

    /// Whether the backend is currently able to deliver
    fn is_connected(&self) -> bool {
        true
    }

    /// Stop delivering; pending and future pops fail with `QueueError::Closed`
    async fn close(&self);
}

/// Serialize `value` as JSON and push it to `channel`
pub async fn push_json<T: Serialize + ?Sized>(
    queue: &dyn JobQueue,
    channel: &str,
    value: &T,
) -> Result<(), QueueError> {
    let payload = serde_json::to_vec(value)?;
    queue.push(channel, payload).await
}
