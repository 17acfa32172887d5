//! Impure I/O side of the MQTT queue backend

use super::connection::{
    configure_mqtt_options, route_mqtt_event, ConnectionState, EventRoute, MqttError,
    ReconnectConfig,
};
use crate::config::QueueSection;
use crate::observability::metrics::metrics;
use crate::queue::{JobQueue, QueueError, QueueReply};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);

type Inbox = Arc<AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>>;

#[derive(Default)]
struct Inboxes {
    senders: HashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
    receivers: HashMap<String, Inbox>,
    closed: bool,
}

impl Inboxes {
    fn receiver(&mut self, topic: &str) -> Option<Inbox> {
        if self.closed {
            return None;
        }
        if !self.receivers.contains_key(topic) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.insert(topic.to_string(), tx);
            self.receivers
                .insert(topic.to_string(), Arc::new(AsyncMutex::new(rx)));
        }
        self.receivers.get(topic).cloned()
    }

    fn deliver(&self, topic: &str, payload: Vec<u8>) -> bool {
        self.senders
            .get(topic)
            .map(|tx| tx.send(payload).is_ok())
            .unwrap_or(false)
    }

    fn close(&mut self) {
        self.closed = true;
        self.senders.clear();
    }
}

/// Queue backed by an MQTT broker
pub struct MqttQueue {
    platform: String,
    client: AsyncClient,
    inboxes: Arc<Mutex<Inboxes>>,
    subscribed: Arc<Mutex<Vec<String>>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttQueue {
    /// Connect to the broker and wait for the connection acknowledgement
    pub async fn connect(platform: &str, config: &QueueSection) -> Result<Self, MqttError> {
        Self::connect_with(platform, config, ReconnectConfig::default()).await
    }

    pub async fn connect_with(
        platform: &str,
        config: &QueueSection,
        reconnect_config: ReconnectConfig,
    ) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(platform, config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);
        metrics().queue_connection_attempt();

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inboxes = Arc::new(Mutex::new(Inboxes::default()));
        let subscribed = Arc::new(Mutex::new(Vec::new()));

        let supervisor = Supervisor {
            platform: platform.to_string(),
            client: client.clone(),
            inboxes: inboxes.clone(),
            subscribed: subscribed.clone(),
            state_tx,
            reconnect_config,
        };
        let handle = tokio::spawn(supervisor.run(event_loop, shutdown_rx));

        let queue = Self {
            platform: platform.to_string(),
            client,
            inboxes,
            subscribed,
            state_rx: state_rx.clone(),
            shutdown_tx,
            event_loop_handle: Mutex::new(Some(handle)),
        };

        if let Err(e) = wait_for_connection(state_rx, CONNACK_TIMEOUT).await {
            queue.close().await;
            return Err(e);
        }
        info!(platform = %queue.platform, broker = %config.broker_url, "Queue connected");
        Ok(queue)
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    async fn ensure_subscribed(&self, topic: &str) -> Result<(), MqttError> {
        if subscribe_once(&self.client, &self.subscribed, topic).await? {
            debug!(topic, "Subscribed to queue channel");
        }
        Ok(())
    }

    fn inbox(&self, topic: &str) -> Result<Inbox, QueueError> {
        let mut inboxes = self.inboxes.lock().map_err(|_| QueueError::Closed)?;
        inboxes.receiver(topic).ok_or(QueueError::Closed)
    }
}

#[async_trait]
impl JobQueue for MqttQueue {
    async fn blocking_pop(&self, channel: &str) -> Result<QueueReply, QueueError> {
        let inbox = self.inbox(channel)?;
        self.ensure_subscribed(channel).await?;

        let mut rx = inbox.lock().await;
        match rx.recv().await {
            Some(payload) => Ok(QueueReply {
                channel: channel.to_string(),
                payload: Some(payload),
            }),
            None => Err(QueueError::Closed),
        }
    }

    async fn push(&self, channel: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        let state = self.connection_state();
        if let ConnectionState::PermanentlyDisconnected(_) = state {
            return Err(QueueError::Closed);
        }
        if !state.can_publish() {
            return Err(MqttError::NotConnected { state }.into());
        }

        let result = self
            .client
            .publish(channel, QoS::AtLeastOnce, false, payload)
            .await;
        match result {
            Ok(()) => {
                metrics().queue_message_published();
                Ok(())
            }
            Err(e) => {
                metrics().queue_publish_failed();
                Err(MqttError::PublishFailed(Box::new(e)).into())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connection_state().can_publish()
    }

    async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "Disconnect request not delivered");
        }

        let handle = self
            .event_loop_handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!(platform = %self.platform, "Queue event loop shut down"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Queue event loop ended with error: {}", e),
                Err(_) => warn!("Queue event loop didn't shut down gracefully"),
                _ => {}
            }
        }

        if let Ok(mut inboxes) = self.inboxes.lock() {
            inboxes.close();
        }
    }
}

/// Subscribe to `topic` unless an earlier request already succeeded
///
/// The topic is only recorded once the request was accepted, so a failed
/// subscribe is retried by the next pop. Returns whether a request was sent.
async fn subscribe_once(
    client: &AsyncClient,
    subscribed: &Mutex<Vec<String>>,
    topic: &str,
) -> Result<bool, MqttError> {
    fn poisoned<T>(_: PoisonError<T>) -> MqttError {
        MqttError::ConnectionFailed("subscription list poisoned".into())
    }

    let already = {
        let topics = subscribed.lock().map_err(poisoned)?;
        topics.iter().any(|t| t == topic)
    };
    if already {
        return Ok(false);
    }

    client
        .subscribe(topic, QoS::AtLeastOnce)
        .await
        .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;

    {
        let mut topics = subscribed.lock().map_err(poisoned)?;
        if !topics.iter().any(|t| t == topic) {
            topics.push(topic.to_string());
        }
    }
    Ok(true)
}

/// Wait for the first ConnAck, failing on permanent disconnect or timeout
async fn wait_for_connection(
    mut state_rx: watch::Receiver<ConnectionState>,
    timeout: Duration,
) -> Result<(), MqttError> {
    let outcome = tokio::time::timeout(timeout, async {
        loop {
            match &*state_rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::PermanentlyDisconnected(reason) => {
                    return Err(MqttError::ConnectionFailed(reason.clone()))
                }
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(MqttError::ConnectionFailed(
                    "state channel closed".to_string(),
                ));
            }
        }
    })
    .await;

    outcome.unwrap_or_else(|_| {
        Err(MqttError::ConnectionFailed(
            "ConnAck timeout - no connection confirmation received".to_string(),
        ))
    })
}

/// Event-loop owner: routes publishes into inboxes and drives reconnection
struct Supervisor {
    platform: String,
    client: AsyncClient,
    inboxes: Arc<Mutex<Inboxes>>,
    subscribed: Arc<Mutex<Vec<String>>>,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_config: ReconnectConfig,
}

impl Supervisor {
    async fn run(self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        info!(platform = %self.platform, "Starting queue event loop");
        let mut attempts = 0u32;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping queue event loop");
                        break;
                    }
                }
                event = event_loop.poll() => {
                    let keep_running = match event {
                        Ok(event) => match route_mqtt_event(&event) {
                            EventRoute::ConnectionAcknowledged => {
                                attempts = 0;
                                let _ = self.state_tx.send(ConnectionState::Connected);
                                metrics().queue_connected(true);
                                self.resubscribe().await;
                                true
                            }
                            EventRoute::MessageReceived { topic, payload, retain } => {
                                self.deliver(&topic, payload, retain);
                                true
                            }
                            EventRoute::Disconnected => {
                                self.backoff("disconnected by broker", &mut attempts, shutdown_rx.clone()).await
                            }
                            EventRoute::Other => true,
                        },
                        Err(e) => {
                            error!(platform = %self.platform, error = %e, "Queue event loop error");
                            self.backoff(&e.to_string(), &mut attempts, shutdown_rx.clone()).await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        let _ = self.state_tx.send(ConnectionState::PermanentlyDisconnected(
            "event loop stopped".to_string(),
        ));
        metrics().queue_connected(false);
        if let Ok(mut inboxes) = self.inboxes.lock() {
            inboxes.close();
        }
        info!(platform = %self.platform, "Queue event loop stopped");
    }

    fn deliver(&self, topic: &str, payload: Vec<u8>, retain: bool) {
        if retain {
            debug!(topic, "Ignoring retained message");
            return;
        }
        metrics().queue_message_received();
        let delivered = self
            .inboxes
            .lock()
            .map(|inboxes| inboxes.deliver(topic, payload))
            .unwrap_or(false);
        if !delivered {
            debug!(topic, "Dropping message for channel nobody consumes");
        }
    }

    async fn resubscribe(&self) {
        let topics = self
            .subscribed
            .lock()
            .map(|topics| topics.clone())
            .unwrap_or_default();
        for topic in topics {
            if let Err(e) = self.client.subscribe(&topic, QoS::AtLeastOnce).await {
                error!("Failed to re-subscribe to {}: {}", topic, e);
            }
        }
    }

    /// Sleep before the next poll retries the connection
    ///
    /// Returns false when the loop should stop.
    async fn backoff(
        &self,
        reason: &str,
        attempts: &mut u32,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        let _ = self
            .state_tx
            .send(ConnectionState::Disconnected(reason.to_string()));
        metrics().queue_connected(false);

        let Some((attempt, delay)) = self.reconnect_config.next_attempt(*attempts) else {
            let reason = format!(
                "Max reconnection attempts ({}) exceeded",
                self.reconnect_config.max_attempts.unwrap_or_default()
            );
            error!(platform = %self.platform, "{}", reason);
            let _ = self
                .state_tx
                .send(ConnectionState::PermanentlyDisconnected(reason));
            return false;
        };

        *attempts = attempt;
        let _ = self.state_tx.send(ConnectionState::Reconnecting(attempt));
        metrics().queue_connection_attempt();
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to broker");

        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
