//! Top-level error types for the platform listener
//!
//! Each layer owns its own error enum (`QueueError`, `SessionError`,
//! `PlatformError`, `RegistryError`); this module folds them into the
//! `ListenerError` returned from construction and startup, and provides the
//! sanitizer applied to every failure string delivered to a client.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for listener operations
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Platform module {locator} unavailable: {message}")]
    PlatformUnavailable { locator: String, message: String },

    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("Listener already started")]
    AlreadyStarted,

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl ListenerError {
    /// Create platform unavailable error
    pub fn platform_unavailable<L: Into<String>, M: Into<String>>(locator: L, message: M) -> Self {
        Self::PlatformUnavailable {
            locator: locator.into(),
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

/// Result type for listener operations
pub type ListenerResult<T> = Result<T, ListenerError>;

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

/// Sanitize a failure string before it leaves the listener
///
/// Redacts `token=...` style secrets and credential paths and caps the
/// result at 500 bytes.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], TRUNCATE_SUFFIX);
    }

    sanitized
}
