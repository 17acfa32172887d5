//! Fatal escalation channel
//!
//! Unexpected errors during verb invocation or instance initialization put
//! the process in an unknown state. They are reported through `FatalSignal`
//! and observed by whoever supervises the listener, which shuts down and
//! exits so the process can be respawned.

use crate::observability::metrics::metrics;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::error;

/// An unrecoverable condition raised while processing a job
#[derive(Debug, Clone, Error, PartialEq)]
#[error("RESET PLATFORM {platform}: {stage} failed for session {session_id}: {message}")]
pub struct FatalError {
    pub platform: String,
    pub session_id: String,
    /// `init` or the verb being invoked
    pub stage: String,
    pub message: String,
}

/// Sending half of the fatal channel
#[derive(Debug, Clone)]
pub struct FatalSignal {
    tx: mpsc::UnboundedSender<FatalError>,
}

impl FatalSignal {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FatalError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn raise(&self, fatal: FatalError) {
        error!(
            platform = %fatal.platform,
            session_id = %fatal.session_id,
            stage = %fatal.stage,
            "{}", fatal
        );
        metrics().fatal_escalation();
        if self.tx.send(fatal).is_err() {
            error!("Fatal escalation has no supervisor listening");
        }
    }
}

/// Message carried by a task that panicked or was cancelled
pub(crate) fn describe_join_error(error: JoinError) -> String {
    if error.is_cancelled() {
        return "task cancelled".to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
