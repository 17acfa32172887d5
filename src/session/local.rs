//! In-process session store
//!
//! Sessions live in memory. Job reports are serialized as `JobReport` and
//! pushed onto the session's outgoing channel; control messages go to the
//! dispatcher's subsystem channel.

use super::{
    CleanupEvent, ClientManager, PlatformSession, ResponseHandler, Session, SessionError,
    SessionStore,
};
use crate::protocol::{subsystem_verbs, ChannelNames, Job, JobReport, SubsystemMessage};
use crate::queue::{push_json, JobQueue};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

const CLEANUP_EVENT_CAPACITY: usize = 64;

/// Session store keeping every session in memory
pub struct LocalSessionStore {
    channels: ChannelNames,
    queue: Arc<dyn JobQueue>,
    sessions: Mutex<HashMap<String, Arc<LocalSession>>>,
    enc_key: Mutex<Option<String>>,
    key_tx: watch::Sender<bool>,
    cleanup_tx: broadcast::Sender<CleanupEvent>,
    destroyed: AtomicBool,
}

impl LocalSessionStore {
    pub fn new(channels: ChannelNames, queue: Arc<dyn JobQueue>) -> Self {
        let (key_tx, _) = watch::channel(false);
        let (cleanup_tx, _) = broadcast::channel(CLEANUP_EVENT_CAPACITY);
        Self {
            channels,
            queue,
            sessions: Mutex::new(HashMap::new()),
            enc_key: Mutex::new(None),
            key_tx,
            cleanup_tx,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Store created with the key already known
    pub fn with_enc_key(channels: ChannelNames, queue: Arc<dyn JobQueue>, key: &str) -> Self {
        let store = Self::new(channels, queue);
        store.set_enc_key(key);
        store
    }

    pub fn set_enc_key(&self, key: &str) {
        if let Ok(mut current) = self.enc_key.lock() {
            *current = Some(key.to_string());
        }
        self.key_tx.send_replace(true);
        info!("Encryption key set");
    }

    pub fn enc_key(&self) -> Option<String> {
        self.enc_key.lock().ok().and_then(|key| key.clone())
    }

    /// Announce that sessions went away
    pub fn emit_cleanup(&self, event: CleanupEvent) {
        if self.cleanup_tx.send(event).is_err() {
            debug!("No listener subscribed to cleanup events");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for LocalSessionStore {
    async fn get(&self, session_id: &str, create: bool) -> Result<Arc<dyn Session>, SessionError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SessionError::Destroyed);
        }
        let mut sessions = self.sessions.lock().map_err(|_| SessionError::Destroyed)?;

        if let Some(session) = sessions.get(session_id) {
            return Ok(session.clone());
        }
        if !create {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        debug!(session_id, "Creating session");
        let session = Arc::new(LocalSession {
            id: session_id.to_string(),
            outgoing: self.channels.outgoing(session_id),
            queue: self.queue.clone(),
            client_managers: Mutex::new(HashMap::new()),
        });
        sessions.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    fn enc_key_set(&self) -> bool {
        *self.key_tx.borrow()
    }

    fn enc_key_changes(&self) -> Option<watch::Receiver<bool>> {
        Some(self.key_tx.subscribe())
    }

    fn subscribe_cleanup(&self) -> broadcast::Receiver<CleanupEvent> {
        self.cleanup_tx.subscribe()
    }

    async fn send_subsystem(&self, message: SubsystemMessage) -> Result<(), SessionError> {
        push_json(self.queue.as_ref(), &self.channels.dispatcher, &message)
            .await
            .map_err(|e| SessionError::Delivery(e.to_string()))
    }

    async fn handle_subsystem(&self, message: SubsystemMessage) -> Result<(), SessionError> {
        match message.verb.as_str() {
            subsystem_verbs::ENC_KEY => match message.enc_key_value() {
                Some(key) => self.set_enc_key(key),
                None => warn!("Ignoring enc-key message without a key"),
            },
            subsystem_verbs::CLEANUP => match message.cleanup_sids() {
                Some(sids) => {
                    for sid in sids {
                        self.emit_cleanup(CleanupEvent::session(sid));
                    }
                }
                None => self.emit_cleanup(CleanupEvent::shutdown()),
            },
            other => debug!(verb = other, "Ignoring subsystem message"),
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        if let Ok(mut sessions) = self.sessions.lock() {
            info!(sessions = sessions.len(), "Destroying session store");
            sessions.clear();
        }
    }
}

/// Session held by `LocalSessionStore`
pub struct LocalSession {
    id: String,
    outgoing: String,
    queue: Arc<dyn JobQueue>,
    client_managers: Mutex<HashMap<String, Arc<ClientManager>>>,
}

impl Session for LocalSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn platform_session(&self, platform: &str) -> Result<PlatformSession, SessionError> {
        let mut managers = self
            .client_managers
            .lock()
            .map_err(|_| SessionError::NotFound(self.id.clone()))?;
        let manager = managers
            .entry(platform.to_string())
            .or_insert_with(|| Arc::new(ClientManager::new()))
            .clone();
        Ok(PlatformSession::new(&self.id, platform, manager))
    }

    fn response_handler(&self, job: &Job) -> ResponseHandler {
        let queue = self.queue.clone();
        let channel = self.outgoing.clone();
        let job = job.clone();

        ResponseHandler::new(move |error, success, result| {
            let report = JobReport::new(&job, error, success, result);
            let queue = queue.clone();
            let channel = channel.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = push_json(queue.as_ref(), &channel, &report).await {
                            error!(channel = %channel, error = %e, "Failed to deliver job report");
                        }
                    });
                }
                Err(_) => error!(channel = %channel, "No runtime available to deliver job report"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use serde_json::json;
    use std::time::Duration;

    fn store() -> (Arc<MemoryQueue>, LocalSessionStore) {
        let queue = Arc::new(MemoryQueue::new());
        let store = LocalSessionStore::new(ChannelNames::new(None, "github"), queue.clone());
        (queue, store)
    }

    #[tokio::test]
    async fn test_get_creates_once() {
        let (_queue, store) = store();
        assert!(matches!(
            store.get("s1", false).await,
            Err(SessionError::NotFound(_))
        ));

        let first = store.get("s1", true).await.unwrap();
        let second = store.get("s1", false).await.unwrap();
        assert_eq!(first.id(), "s1");
        assert_eq!(second.id(), "s1");
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_platform_session_shares_client_manager() {
        let (_queue, store) = store();
        let session = store.get("s1", true).await.unwrap();

        let a = session.platform_session("github").unwrap();
        a.client_manager.register("user", "github");
        let b = session.platform_session("github").unwrap();
        assert_eq!(b.client_manager.keys(), vec!["user"]);
        assert!(session.platform_session("irc").unwrap().client_manager.is_empty());
    }

    #[tokio::test]
    async fn test_response_handler_pushes_report() {
        let (queue, store) = store();
        let session = store.get("s1", true).await.unwrap();
        let job = Job::new("s1", "send", json!({"text": "hi"}));

        session
            .response_handler(&job)
            .respond(None, true, json!({"id": 42}));

        let payload = queue
            .pop_timeout("listener:github:outgoing:s1", Duration::from_secs(1))
            .await
            .unwrap();
        let report: JobReport = serde_json::from_slice(&payload).unwrap();
        assert_eq!(report.session_id, "s1");
        assert_eq!(report.verb, "send");
        assert!(report.status);
        assert_eq!(report.object, json!({"id": 42}));
    }

    #[tokio::test]
    async fn test_enc_key_broadcast_sets_key() {
        let (_queue, store) = store();
        let mut changes = store.enc_key_changes().unwrap();
        assert!(!store.enc_key_set());

        store
            .handle_subsystem(SubsystemMessage::enc_key("k1"))
            .await
            .unwrap();

        assert!(store.enc_key_set());
        assert_eq!(store.enc_key().as_deref(), Some("k1"));
        assert!(changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_message_emits_events() {
        let (_queue, store) = store();
        let mut events = store.subscribe_cleanup();

        store
            .handle_subsystem(SubsystemMessage::cleanup(Some(vec!["a".into(), "b".into()])))
            .await
            .unwrap();
        store
            .handle_subsystem(SubsystemMessage::cleanup(None))
            .await
            .unwrap();

        assert_eq!(events.recv().await.unwrap(), CleanupEvent::session("a"));
        assert_eq!(events.recv().await.unwrap(), CleanupEvent::session("b"));
        assert_eq!(events.recv().await.unwrap(), CleanupEvent::shutdown());
    }

    #[tokio::test]
    async fn test_send_subsystem_targets_dispatcher_channel() {
        let (queue, store) = store();
        store
            .send_subsystem(SubsystemMessage::key_request("github"))
            .await
            .unwrap();

        let payload = queue.try_pop("dispatcher:subsystem").unwrap();
        let message = SubsystemMessage::parse(&payload).unwrap();
        assert!(message.requests_enc_key());
        assert_eq!(message.platform.as_deref(), Some("github"));
    }

    #[tokio::test]
    async fn test_destroy_rejects_further_lookups() {
        let (_queue, store) = store();
        store.get("s1", true).await.unwrap();
        store.destroy().await;
        assert!(matches!(
            store.get("s1", true).await,
            Err(SessionError::Destroyed)
        ));
        assert_eq!(store.session_count(), 0);
    }
}
