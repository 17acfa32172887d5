//! Session collaborator contract
//!
//! The listener never owns sessions. It asks a `SessionStore` for the
//! session a job belongs to, takes from it a per-platform view used to
//! initialize platform instances, and a response handler bound to the job.
//! The store also decides when the encryption key is available and emits
//! cleanup events when sessions go away.

pub mod local;

pub use local::LocalSessionStore;

use crate::protocol::{Job, SubsystemMessage};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// Session layer errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No session exists for id {0}")]
    NotFound(String),
    #[error("Session store has been destroyed")]
    Destroyed,
    #[error("Failed to deliver message: {0}")]
    Delivery(String),
}

/// Session teardown notification
///
/// `session_id: None` asks for a full listener shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupEvent {
    pub session_id: Option<String>,
}

impl CleanupEvent {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
        }
    }

    pub fn shutdown() -> Self {
        Self { session_id: None }
    }
}

/// Store of client sessions shared by every listener in the gateway
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look a session up, creating it when `create` is set
    async fn get(&self, session_id: &str, create: bool) -> Result<Arc<dyn Session>, SessionError>;

    /// Whether the encryption key has been set
    fn enc_key_set(&self) -> bool;

    /// Change notifications for the key; `None` means callers must poll
    fn enc_key_changes(&self) -> Option<watch::Receiver<bool>> {
        None
    }

    /// Stream of session teardown events
    fn subscribe_cleanup(&self) -> broadcast::Receiver<CleanupEvent>;

    /// Send a control message to another gateway component
    async fn send_subsystem(&self, message: SubsystemMessage) -> Result<(), SessionError>;

    /// Handle a control message received on the subsystem channel
    async fn handle_subsystem(&self, message: SubsystemMessage) -> Result<(), SessionError>;

    /// Tear down all session infrastructure
    async fn destroy(&self);
}

/// One client session
pub trait Session: Send + Sync {
    fn id(&self) -> &str;

    /// Session context scoped to one platform
    fn platform_session(&self, platform: &str) -> Result<PlatformSession, SessionError>;

    /// Reporter bound to `job`
    fn response_handler(&self, job: &Job) -> ResponseHandler;
}

/// Per-platform view of a session handed to `PlatformHandler::init`
#[derive(Debug, Clone)]
pub struct PlatformSession {
    pub session_id: String,
    pub platform: String,
    pub client_manager: Arc<ClientManager>,
}

impl PlatformSession {
    pub fn new(session_id: &str, platform: &str, client_manager: Arc<ClientManager>) -> Self {
        Self {
            session_id: session_id.to_string(),
            platform: platform.to_string(),
            client_manager,
        }
    }
}

/// Registry of downstream client connections opened by a platform instance
///
/// Each entry is keyed by a connection key (for example an account id) and
/// records the names of the platforms that attached listeners to it.
#[derive(Debug, Default)]
pub struct ClientManager {
    clients: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `listener` is attached to the client at `key`
    pub fn register(&self, key: &str, listener: &str) {
        if let Ok(mut clients) = self.clients.lock() {
            clients
                .entry(key.to_string())
                .or_default()
                .insert(listener.to_string());
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.clients
            .lock()
            .map(|clients| clients.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn listeners(&self, key: &str) -> Vec<String> {
        self.clients
            .lock()
            .ok()
            .and_then(|clients| clients.get(key).map(|l| l.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Detach `listener` from the client at `key`
    pub fn remove_listeners(&self, key: &str, listener: &str) {
        if let Ok(mut clients) = self.clients.lock() {
            if let Some(listeners) = clients.get_mut(key) {
                listeners.remove(listener);
            }
        }
    }

    /// Drop the client at `key`; returns whether it existed
    pub fn remove(&self, key: &str) -> bool {
        self.clients
            .lock()
            .map(|mut clients| clients.remove(key).is_some())
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.clients
            .lock()
            .map(|clients| clients.is_empty())
            .unwrap_or(true)
    }
}

type ResponseFn = dyn Fn(Option<String>, bool, Value) + Send + Sync;

/// Reporter bound to a single job: `(error, success, result)`
#[derive(Clone)]
pub struct ResponseHandler {
    inner: Arc<ResponseFn>,
}

impl ResponseHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Option<String>, bool, Value) + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    pub fn respond(&self, error: Option<String>, success: bool, result: Value) {
        (self.inner)(error, success, result)
    }
}

impl fmt::Debug for ResponseHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandler").finish_non_exhaustive()
    }
}
