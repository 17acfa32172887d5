//! Mock implementations for testing
//!
//! Provides a scriptable platform, a counting session store and a recording
//! responder so the dispatcher, registry and coordinator can be exercised
//! without a broker or a real platform API.

use crate::platform::{PlatformError, PlatformFactory, PlatformHandler, VerbError};
use crate::protocol::{subsystem_verbs, Job, SubsystemMessage};
use crate::session::{
    CleanupEvent, ClientManager, PlatformSession, ResponseHandler, Session, SessionError,
    SessionStore,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};

/// How a mock verb behaves when invoked
#[derive(Debug, Clone)]
pub enum VerbBehavior {
    Succeed(Value),
    Fail {
        error: Value,
        partial: Option<Value>,
    },
    Unexpected(String),
    Panic(String),
    /// Wait `Duration`, then succeed with the value
    Delay(Duration, Value),
}

/// How mock cleanup behaves; `None` on the platform means no capability
#[derive(Debug, Clone)]
pub enum CleanupBehavior {
    Succeed,
    Fail(String),
    Hang,
}

/// A recorded verb invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub session_id: Option<String>,
    pub verb: String,
    pub object: Value,
}

/// Scriptable platform shared by every instance its factory creates
#[derive(Default)]
pub struct MockPlatform {
    verbs: Mutex<HashMap<String, VerbBehavior>>,
    cleanup: Mutex<Option<CleanupBehavior>>,
    init_failure: Mutex<Option<String>>,
    panic_on_init: AtomicBool,
    fail_construction: AtomicBool,
    panic_on_construction: AtomicBool,
    init_gate: Mutex<Option<watch::Receiver<bool>>>,
    instances_created: AtomicUsize,
    init_calls: AtomicUsize,
    cleanup_calls: AtomicUsize,
    invocations: Mutex<Vec<Invocation>>,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script `verb`
    pub fn on_verb(&self, verb: &str, behavior: VerbBehavior) {
        if let Ok(mut verbs) = self.verbs.lock() {
            verbs.insert(verb.to_string(), behavior);
        }
    }

    /// Give instances a cleanup capability
    pub fn with_cleanup(&self, behavior: CleanupBehavior) {
        if let Ok(mut cleanup) = self.cleanup.lock() {
            *cleanup = Some(behavior);
        }
    }

    pub fn fail_next_init(&self, message: &str) {
        if let Ok(mut failure) = self.init_failure.lock() {
            *failure = Some(message.to_string());
        }
    }

    pub fn panic_on_init(&self) {
        self.panic_on_init.store(true, Ordering::SeqCst);
    }

    pub fn fail_construction(&self) {
        self.fail_construction.store(true, Ordering::SeqCst);
    }

    /// Make every later factory call panic
    pub fn panic_on_construction(&self) {
        self.panic_on_construction.store(true, Ordering::SeqCst);
    }

    /// Block every `init` until the returned sender publishes `true`
    pub fn hold_init(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        if let Ok(mut gate) = self.init_gate.lock() {
            *gate = Some(rx);
        }
        tx
    }

    pub fn factory(self: &Arc<Self>) -> PlatformFactory {
        let platform = self.clone();
        Arc::new(move || {
            if platform.panic_on_construction.load(Ordering::SeqCst) {
                panic!("mock factory panicked");
            }
            if platform.fail_construction.load(Ordering::SeqCst) {
                return Err(PlatformError::Construction(
                    "mock factory refused".to_string(),
                ));
            }
            platform.instances_created.fetch_add(1, Ordering::SeqCst);
            let handler: Arc<dyn PlatformHandler> = Arc::new(MockHandler {
                platform: platform.clone(),
                session: Mutex::new(None),
            });
            Ok(handler)
        })
    }

    pub fn instances_created(&self) -> usize {
        self.instances_created.load(Ordering::SeqCst)
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .map(|i| i.clone())
            .unwrap_or_default()
    }

    fn verb(&self, verb: &str) -> Option<VerbBehavior> {
        self.verbs.lock().ok().and_then(|v| v.get(verb).cloned())
    }

    fn cleanup_behavior(&self) -> Option<CleanupBehavior> {
        self.cleanup.lock().ok().and_then(|c| c.clone())
    }
}

struct MockHandler {
    platform: Arc<MockPlatform>,
    session: Mutex<Option<PlatformSession>>,
}

#[async_trait]
impl PlatformHandler for MockHandler {
    async fn init(&self, session: PlatformSession) -> Result<(), PlatformError> {
        self.platform.init_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.platform.init_gate.lock().ok().and_then(|g| g.clone());
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }

        if self.platform.panic_on_init.load(Ordering::SeqCst) {
            panic!("mock init panicked");
        }
        let failure = self
            .platform
            .init_failure
            .lock()
            .ok()
            .and_then(|mut f| f.take());
        if let Some(message) = failure {
            return Err(PlatformError::InitFailed(message));
        }

        if let Ok(mut current) = self.session.lock() {
            *current = Some(session);
        }
        Ok(())
    }

    fn supports(&self, verb: &str) -> bool {
        self.platform.verb(verb).is_some()
    }

    async fn invoke(&self, verb: &str, job: &Job) -> Result<Value, VerbError> {
        let session_id = self
            .session
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.session_id.clone()));
        if let Ok(mut invocations) = self.platform.invocations.lock() {
            invocations.push(Invocation {
                session_id,
                verb: verb.to_string(),
                object: job.object.clone(),
            });
        }

        match self.platform.verb(verb) {
            Some(VerbBehavior::Succeed(value)) => Ok(value),
            Some(VerbBehavior::Fail { error, partial }) => Err(VerbError::Failed { error, partial }),
            Some(VerbBehavior::Unexpected(message)) => Err(VerbError::Unexpected(message)),
            Some(VerbBehavior::Panic(message)) => panic!("{}", message),
            Some(VerbBehavior::Delay(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            None => Err(VerbError::failed(format!("mock has no verb {verb}"))),
        }
    }

    fn has_cleanup(&self) -> bool {
        self.platform.cleanup_behavior().is_some()
    }

    async fn cleanup(&self) -> Result<(), PlatformError> {
        self.platform.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        match self.platform.cleanup_behavior() {
            Some(CleanupBehavior::Succeed) | None => Ok(()),
            Some(CleanupBehavior::Fail(message)) => Err(PlatformError::CleanupFailed(message)),
            Some(CleanupBehavior::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// One captured `(error, success, result)` report
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub session_id: Option<String>,
    pub verb: String,
    pub error: Option<String>,
    pub success: bool,
    pub result: Value,
}

/// Captures every report delivered through its response handlers
#[derive(Default, Clone)]
pub struct RecordingResponder {
    reports: Arc<Mutex<Vec<Report>>>,
    notify: Arc<Notify>,
}

impl RecordingResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response handler bound to `job`
    pub fn handler(&self, job: &Job) -> ResponseHandler {
        let reports = self.reports.clone();
        let notify = self.notify.clone();
        let session_id = job.session_id().map(str::to_string);
        let verb = job.verb.clone();
        ResponseHandler::new(move |error, success, result| {
            if let Ok(mut reports) = reports.lock() {
                reports.push(Report {
                    session_id: session_id.clone(),
                    verb: verb.clone(),
                    error,
                    success,
                    result,
                });
            }
            notify.notify_waiters();
        })
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Wait until at least `count` reports arrived or `timeout` passed
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Report> {
        let _ = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.reports().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
        self.reports()
    }
}

/// Session store that counts lookups and records reports
pub struct MockSessionStore {
    responder: RecordingResponder,
    lookups: AtomicUsize,
    fail_lookups: AtomicBool,
    destroyed: AtomicUsize,
    client_managers: Mutex<HashMap<String, Arc<ClientManager>>>,
    key_tx: watch::Sender<bool>,
    cleanup_tx: broadcast::Sender<CleanupEvent>,
    sent: Mutex<Vec<SubsystemMessage>>,
    handled: Mutex<Vec<SubsystemMessage>>,
}

impl Default for MockSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSessionStore {
    /// Store with the encryption key already set
    pub fn new() -> Self {
        let store = Self::without_key();
        store.set_enc_key(true);
        store
    }

    pub fn without_key() -> Self {
        let (key_tx, _) = watch::channel(false);
        let (cleanup_tx, _) = broadcast::channel(16);
        Self {
            responder: RecordingResponder::new(),
            lookups: AtomicUsize::new(0),
            fail_lookups: AtomicBool::new(false),
            destroyed: AtomicUsize::new(0),
            client_managers: Mutex::new(HashMap::new()),
            key_tx,
            cleanup_tx,
            sent: Mutex::new(Vec::new()),
            handled: Mutex::new(Vec::new()),
        }
    }

    pub fn set_enc_key(&self, set: bool) {
        self.key_tx.send_replace(set);
    }

    pub fn fail_lookups(&self) {
        self.fail_lookups.store(true, Ordering::SeqCst);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn responder(&self) -> &RecordingResponder {
        &self.responder
    }

    pub fn emit_cleanup(&self, event: CleanupEvent) {
        let _ = self.cleanup_tx.send(event);
    }

    /// Client manager shared by every platform view of `session_id`
    pub fn client_manager(&self, session_id: &str) -> Arc<ClientManager> {
        self.client_managers
            .lock()
            .map(|mut managers| {
                managers
                    .entry(session_id.to_string())
                    .or_insert_with(|| Arc::new(ClientManager::new()))
                    .clone()
            })
            .unwrap_or_default()
    }

    pub fn sent_messages(&self) -> Vec<SubsystemMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn handled_messages(&self) -> Vec<SubsystemMessage> {
        self.handled.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for MockSessionStore {
    async fn get(&self, session_id: &str, _create: bool) -> Result<Arc<dyn Session>, SessionError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        Ok(Arc::new(MockSession {
            id: session_id.to_string(),
            client_manager: self.client_manager(session_id),
            responder: self.responder.clone(),
        }))
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
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message);
        }
        Ok(())
    }

    async fn handle_subsystem(&self, message: SubsystemMessage) -> Result<(), SessionError> {
        if message.verb == subsystem_verbs::ENC_KEY && message.enc_key_value().is_some() {
            self.set_enc_key(true);
        }
        if let Ok(mut handled) = self.handled.lock() {
            handled.push(message);
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockSession {
    id: String,
    client_manager: Arc<ClientManager>,
    responder: RecordingResponder,
}

impl Session for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn platform_session(&self, platform: &str) -> Result<PlatformSession, SessionError> {
        Ok(PlatformSession::new(
            &self.id,
            platform,
            self.client_manager.clone(),
        ))
    }

    fn response_handler(&self, job: &Job) -> ResponseHandler {
        self.responder.handler(job)
    }
}

/// Job with a text payload for `session_id`
pub fn text_job(session_id: &str, verb: &str, text: &str) -> Job {
    Job::new(session_id, verb, json!({ "text": text }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_responder_waits_for_reports() {
        let responder = RecordingResponder::new();
        let handler = responder.handler(&text_job("s1", "send", "hi"));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handler.respond(None, true, json!({"id": 1}));
        });

        let reports = responder.wait_for(1, Duration::from_secs(1)).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].session_id.as_deref(), Some("s1"));
        assert!(reports[0].success);
    }

    #[tokio::test]
    async fn test_mock_platform_scripts_verbs() {
        let platform = MockPlatform::new();
        platform.on_verb("send", VerbBehavior::Succeed(json!({"ok": true})));
        let handler = (platform.factory())().unwrap();

        let context = PlatformSession::new("s1", "mock", Arc::new(ClientManager::new()));
        handler.init(context).await.unwrap();

        assert!(handler.supports("send"));
        assert!(!handler.supports("join"));
        let result = handler
            .invoke("send", &text_job("s1", "send", "hi"))
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(platform.invocations()[0].session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_mock_session_store_counts_lookups() {
        let store = MockSessionStore::new();
        assert!(store.enc_key_set());
        store.get("a", true).await.unwrap();
        store.get("b", true).await.unwrap();
        assert_eq!(store.lookups(), 2);

        store.fail_lookups();
        assert!(store.get("c", true).await.is_err());
    }
}
