//! Per-platform listener
//!
//! A `Listener` hosts one platform. Once the encryption key is available it
//! consumes jobs from the platform's incoming channel and dispatches each
//! to the session's platform instance. It also forwards subsystem control
//! messages to the session store and reacts to the store's cleanup events.
//!
//! ```text
//! key gate -> consumer -> dispatcher -> registry -> handler verb -> reporter
//!                  cleanup events -> coordinator
//! ```

pub mod consumer;
pub mod coordinator;
pub mod dispatcher;
pub mod fatal;
pub mod gate;
pub mod registry;
pub mod reporter;

pub use consumer::{ConsumerExit, QueueConsumer};
pub use coordinator::{CleanupCoordinator, ShutdownReport};
pub use dispatcher::{DispatchError, DispatchOutcome, JobDispatcher};
pub use fatal::{FatalError, FatalSignal};
pub use gate::KeyReadinessGate;
pub use registry::{InstanceRegistry, RegistryError};

use crate::config::ListenerConfig;
use crate::error::{ListenerError, ListenerResult};
use crate::observability::health::HealthServer;
use crate::observability::metrics::metrics;
use crate::platform::PlatformCatalog;
use crate::protocol::{ChannelNames, Job, SubsystemMessage};
use crate::queue::JobQueue;
use crate::session::SessionStore;
use gate::wait_for_shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const QUEUE_STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Where the listener is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    AwaitingKey,
    Consuming,
    ShuttingDown,
    Stopped,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Created => "created",
            ListenerState::AwaitingKey => "awaiting_key",
            ListenerState::Consuming => "consuming",
            ListenerState::ShuttingDown => "shutting_down",
            ListenerState::Stopped => "stopped",
        }
    }
}

/// Worker for a single platform
pub struct Listener {
    config: ListenerConfig,
    channels: ChannelNames,
    queue: Arc<dyn JobQueue>,
    sessions: Arc<dyn SessionStore>,
    dispatcher: Arc<JobDispatcher>,
    coordinator: Arc<CleanupCoordinator>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<FatalError>>>,
    state_tx: watch::Sender<ListenerState>,
    shutdown_tx: watch::Sender<bool>,
    health_server: Mutex<Option<Arc<HealthServer>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Listener {
    /// Build a listener for the configured platform
    ///
    /// The platform module is resolved from `catalog` and one probe
    /// instance is constructed; startup fails if either step does.
    pub fn new(
        config: ListenerConfig,
        catalog: &PlatformCatalog,
        queue: Arc<dyn JobQueue>,
        sessions: Arc<dyn SessionStore>,
    ) -> ListenerResult<Self> {
        config.validate()?;
        let platform = config.platform.name.clone();
        let locator = config.platform.locator().to_string();

        let factory = catalog
            .resolve(&locator)
            .map_err(|e| ListenerError::platform_unavailable(&locator, e.to_string()))?;
        let probe =
            factory().map_err(|e| ListenerError::platform_unavailable(&locator, e.to_string()))?;
        for verb in &config.platform.verbs {
            if !probe.supports(verb) {
                warn!(platform = %platform, verb = %verb, "Advertised verb not implemented by platform module");
            }
        }
        drop(probe);

        let channels = config.channels();
        let registry = Arc::new(InstanceRegistry::new(&platform, factory, sessions.clone()));
        let (fatal, fatal_rx) = FatalSignal::channel();
        let dispatcher = Arc::new(JobDispatcher::new(
            &platform,
            registry.clone(),
            sessions.clone(),
            fatal,
        ));
        let coordinator = Arc::new(CleanupCoordinator::new(
            &platform,
            registry,
            sessions.clone(),
            config.timing.shutdown_deadline(),
        ));
        let (state_tx, _) = watch::channel(ListenerState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        info!(platform = %platform, incoming = %channels.incoming, "Listener created");
        Ok(Self {
            config,
            channels,
            queue,
            sessions,
            dispatcher,
            coordinator,
            fatal_rx: Mutex::new(Some(fatal_rx)),
            state_tx,
            shutdown_tx,
            health_server: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn set_health_server(&self, health_server: Arc<HealthServer>) {
        if let Ok(mut current) = self.health_server.lock() {
            *current = Some(health_server);
        }
    }

    pub fn platform(&self) -> &str {
        &self.config.platform.name
    }

    pub fn channels(&self) -> &ChannelNames {
        &self.channels
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        self.dispatcher.registry()
    }

    pub fn dispatcher(&self) -> &Arc<JobDispatcher> {
        &self.dispatcher
    }

    pub fn coordinator(&self) -> &Arc<CleanupCoordinator> {
        &self.coordinator
    }

    /// Whether the session store has the encryption key
    pub fn enc_key_set(&self) -> bool {
        self.sessions.enc_key_set()
    }

    pub fn state(&self) -> ListenerState {
        *self.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ListenerState> {
        self.state_tx.subscribe()
    }

    /// Receiver for fatal escalations; available once
    pub fn take_fatal_receiver(&self) -> Option<mpsc::UnboundedReceiver<FatalError>> {
        self.fatal_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    fn set_state(&self, state: ListenerState) {
        self.state_tx.send_replace(state);
        metrics().set_listener_state(state.as_str());
        debug!(platform = %self.platform(), state = state.as_str(), "Listener state changed");
    }

    fn health(&self) -> Option<Arc<HealthServer>> {
        self.health_server.lock().ok().and_then(|h| h.clone())
    }

    /// Start the background tasks
    ///
    /// Returns immediately; jobs are consumed once the key gate opens.
    pub fn start(self: &Arc<Self>) -> ListenerResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ListenerError::AlreadyStarted);
        }
        info!(platform = %self.platform(), "Starting listener");

        let mut handles = vec![
            tokio::spawn(self.clone().run_cleanup_events()),
            tokio::spawn(self.clone().run_subsystem()),
            tokio::spawn(self.clone().run_jobs()),
        ];
        if let Some(health) = self.health() {
            handles.push(tokio::spawn(self.clone().report_queue_status(health)));
        }

        self.tasks
            .lock()
            .map_err(|_| ListenerError::internal_error("task list poisoned"))?
            .extend(handles);
        Ok(())
    }

    /// Clean up `session_ids`, or every session when `None`, and stop consuming
    pub async fn shutdown(&self, session_ids: Option<Vec<String>>) -> ShutdownReport {
        let span = crate::lifecycle_span!(platform = %self.platform(), event = "shutdown");
        async {
            info!("Listener shutting down");
            self.set_state(ListenerState::ShuttingDown);
            self.shutdown_tx.send_replace(true);
            if let Some(health) = self.health() {
                health.set_consuming(false);
            }

            let report = self.coordinator.shutdown(session_ids).await;

            let tasks = self
                .tasks
                .lock()
                .map(|mut tasks| std::mem::take(&mut *tasks))
                .unwrap_or_default();
            for task in tasks {
                if !task.is_finished() {
                    task.abort();
                }
            }

            self.set_state(ListenerState::Stopped);
            report
        }
        .instrument(span)
        .await
    }

    async fn run_jobs(self: Arc<Self>) {
        let platform = self.platform().to_string();
        let shutdown = self.shutdown_tx.subscribe();

        if !self.sessions.enc_key_set() {
            info!(platform = %platform, "Requesting encryption key from dispatcher");
            if let Err(e) = self
                .sessions
                .send_subsystem(SubsystemMessage::key_request(&platform))
                .await
            {
                error!(platform = %platform, error = %e, "Failed to request encryption key");
            }
        }

        self.set_state(ListenerState::AwaitingKey);
        let gate = KeyReadinessGate::new(
            self.sessions.clone(),
            self.config.timing.key_initial_delay(),
            self.config.timing.key_poll_interval(),
        );
        if !gate.wait(shutdown.clone()).await {
            return;
        }

        metrics().set_enc_key_ready(true);
        if let Some(health) = self.health() {
            health.set_consuming(true);
        }
        self.set_state(ListenerState::Consuming);

        let consumer = QueueConsumer::new(
            &platform,
            &self.channels.incoming,
            self.queue.clone(),
            self.config.timing.queue_retry_delay(),
        );
        let dispatcher = self.dispatcher.clone();
        let exit = consumer
            .run(shutdown, |job: Job| {
                metrics().job_received();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.dispatch(job).await {
                        debug!(error = %e, "Job ended without a report");
                    }
                });
            })
            .await;

        if exit == ConsumerExit::QueueClosed {
            error!(platform = %platform, "Job queue closed, listener stopped");
            if let Some(health) = self.health() {
                health.set_consuming(false);
            }
            self.set_state(ListenerState::Stopped);
        }
    }

    async fn run_subsystem(self: Arc<Self>) {
        let consumer = QueueConsumer::new(
            self.platform(),
            &self.channels.subsystem,
            self.queue.clone(),
            self.config.timing.queue_retry_delay(),
        );
        let sessions = self.sessions.clone();
        consumer
            .run(self.shutdown_tx.subscribe(), |message: SubsystemMessage| {
                let sessions = sessions.clone();
                tokio::spawn(async move {
                    debug!(verb = %message.verb, "Forwarding subsystem message");
                    if let Err(e) = sessions.handle_subsystem(message).await {
                        warn!(error = %e, "Session store rejected subsystem message");
                    }
                });
            })
            .await;
    }

    async fn run_cleanup_events(self: Arc<Self>) {
        let mut events = self.sessions.subscribe_cleanup();
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = wait_for_shutdown(&mut shutdown) => return,
            };

            match event {
                Ok(event) => match event.session_id {
                    Some(session_id) => {
                        let coordinator = self.coordinator.clone();
                        tokio::spawn(async move { coordinator.cleanup_session(&session_id).await });
                    }
                    None => {
                        info!(platform = %self.platform(), "Cleanup requested for all sessions");
                        let listener = self.clone();
                        // Shutdown aborts this task, so run it detached
                        tokio::spawn(async move {
                            listener.shutdown(None).await;
                        });
                        return;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(platform = %self.platform(), missed, "Missed cleanup events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn report_queue_status(self: Arc<Self>, health: Arc<HealthServer>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(QUEUE_STATUS_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => health.set_queue_connected(self.queue.is_connected()),
                _ = wait_for_shutdown(&mut shutdown) => return,
            }
        }
    }
}
