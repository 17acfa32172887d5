//! Platform handler contract and catalog
//!
//! A platform module is a factory producing one `PlatformHandler` per
//! session. The handler is initialized once with the session's platform
//! view, then receives verbs (`send`, `retrieve`, `create`, ...) for that
//! session until it is cleaned up.

pub mod github;

pub use github::GithubPlatform;

use crate::config::ListenerConfig;
use crate::protocol::Job;
use crate::session::{PlatformSession, SessionError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Per-session platform instance
#[async_trait]
pub trait PlatformHandler: Send + Sync {
    /// Called once before the first verb for the session
    async fn init(&self, session: PlatformSession) -> Result<(), PlatformError>;

    /// Whether `verb` is implemented by this platform
    fn supports(&self, verb: &str) -> bool;

    /// Run `verb` for `job`
    ///
    /// Only called after `init` succeeded and for verbs `supports` accepts.
    async fn invoke(&self, verb: &str, job: &Job) -> Result<Value, VerbError>;

    /// Whether `cleanup` does anything
    fn has_cleanup(&self) -> bool {
        false
    }

    /// Release resources held for the session
    ///
    /// Only called once `init` succeeded, and at most once per instance.
    async fn cleanup(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}

/// Outcome of a failed verb
#[derive(Debug, Clone, Error)]
pub enum VerbError {
    /// Expected failure reported by the platform
    ///
    /// `error` is whatever the platform rejected with: a string, or an
    /// object that usually carries a `message` field.
    #[error("{}", describe_error(.error))]
    Failed {
        error: Value,
        partial: Option<Value>,
    },
    /// Anything the platform did not anticipate; escalated as fatal
    #[error("{0}")]
    Unexpected(String),
}

impl VerbError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            error: Value::String(message.into()),
            partial: None,
        }
    }

    pub fn failed_with_partial(message: impl Into<String>, partial: Value) -> Self {
        Self::Failed {
            error: Value::String(message.into()),
            partial: Some(partial),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn is_unexpected(&self) -> bool {
        matches!(self, VerbError::Unexpected(_))
    }
}

/// Human-readable form of a rejection value
///
/// Strings are used as-is, then an object's `message` field, then the JSON
/// rendering of the value.
pub fn describe_error(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(fields) => match fields.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => error.to_string(),
        },
        Value::Null => "unknown error".to_string(),
        other => other.to_string(),
    }
}

/// Errors from platform construction, initialization and cleanup
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Platform module not found: {0}")]
    ModuleNotFound(String),
    #[error("Failed to construct platform instance: {0}")]
    Construction(String),
    #[error("Initialization failed: {0}")]
    InitFailed(String),
    #[error("Cleanup failed: {0}")]
    CleanupFailed(String),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Produces a fresh handler for each session
pub type PlatformFactory =
    Arc<dyn Fn() -> Result<Arc<dyn PlatformHandler>, PlatformError> + Send + Sync>;

/// Platform modules available to the listener, keyed by locator
#[derive(Default, Clone)]
pub struct PlatformCatalog {
    factories: HashMap<String, PlatformFactory>,
}

impl PlatformCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every built-in platform
    pub fn builtin(config: &ListenerConfig) -> Self {
        let mut catalog = Self::new();
        let github = config.platforms.github.clone();
        catalog.register("github", move || {
            let handler: Arc<dyn PlatformHandler> = Arc::new(GithubPlatform::new(&github)?);
            Ok(handler)
        });
        catalog
    }

    pub fn register<F>(&mut self, locator: &str, factory: F)
    where
        F: Fn() -> Result<Arc<dyn PlatformHandler>, PlatformError> + Send + Sync + 'static,
    {
        self.factories.insert(locator.to_string(), Arc::new(factory));
    }

    pub fn resolve(&self, locator: &str) -> Result<PlatformFactory, PlatformError> {
        self.factories
            .get(locator)
            .cloned()
            .ok_or_else(|| PlatformError::ModuleNotFound(locator.to_string()))
    }

    pub fn locators(&self) -> Vec<String> {
        let mut locators: Vec<_> = self.factories.keys().cloned().collect();
        locators.sort();
        locators
    }
}

impl fmt::Debug for PlatformCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformCatalog")
            .field("locators", &self.locators())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_describe_error_prefers_string_then_message() {
        assert_eq!(describe_error(&json!("boom")), "boom");
        assert_eq!(
            describe_error(&json!({"message": "rate limited", "code": 429})),
            "rate limited"
        );
        assert_eq!(describe_error(&json!({"code": 500})), r#"{"code":500}"#);
        assert_eq!(describe_error(&json!(42)), "42");
        assert_eq!(describe_error(&Value::Null), "unknown error");
    }

    #[test]
    fn test_verb_error_display() {
        assert_eq!(VerbError::failed("nope").to_string(), "nope");
        let structured = VerbError::Failed {
            error: json!({"message": "denied"}),
            partial: None,
        };
        assert_eq!(structured.to_string(), "denied");
        assert!(VerbError::unexpected("panic").is_unexpected());
        assert!(!VerbError::failed("x").is_unexpected());
    }

    #[test]
    fn test_builtin_catalog_contains_github() {
        let catalog = PlatformCatalog::builtin(&ListenerConfig::for_platform("github"));
        assert_eq!(catalog.locators(), vec!["github"]);
        let factory = catalog.resolve("github").unwrap();
        let handler = factory().unwrap();
        assert!(handler.supports("retrieve"));
        assert!(handler.supports("create"));
        assert!(!handler.supports("send"));
        assert!(!handler.has_cleanup());
    }

    #[test]
    fn test_unknown_locator() {
        let catalog = PlatformCatalog::new();
        assert!(matches!(
            catalog.resolve("irc"),
            Err(PlatformError::ModuleNotFound(name)) if name == "irc"
        ));
    }
}
