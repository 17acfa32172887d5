//! Pure connection state management for the MQTT queue backend
//!
//! Connection states, reconnection backoff and option construction live
//! here; the I/O side is in `client`.

use crate::config::QueueSection;
use rumqttc::v5::{Event, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Where the queue's broker session stands
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Waiting for the first CONNACK
    Connecting,
    /// Broker acknowledged the connection
    Connected,
    /// Lost the broker; carries the reason
    Disconnected(String),
    /// Sleeping before reconnect attempt N
    Reconnecting(u32),
    /// Gave up or closed; no further attempts are made
    PermanentlyDisconnected(String),
}

impl ConnectionState {
    pub fn can_publish(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Reconnect schedule
///
/// Delays follow `steps` in order, then stay at `ceiling` for every later
/// attempt.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
    pub steps: Vec<Duration>,
    pub ceiling: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            steps: [25, 50, 100, 250]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            ceiling: Duration::from_millis(250),
        }
    }
}

impl ReconnectConfig {
    /// Delay before 1-based attempt number `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        attempt
            .checked_sub(1)
            .and_then(|i| self.steps.get(i as usize))
            .copied()
            .unwrap_or(self.ceiling)
    }

    /// Attempt number and delay that follow `failures` failed attempts, if any
    pub fn next_attempt(&self, failures: u32) -> Option<(u32, Duration)> {
        let attempt = failures.saturating_add(1);
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        Some((attempt, self.delay_for(attempt)))
    }
}

/// MQTT queue backend errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("broker connection failed: {0}")]
    ConnectionFailed(String),
    #[error("publish to broker failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("subscribe failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("queue not connected (state: {state:?})")]
    NotConnected { state: ConnectionState },
}

/// Host, port and TLS flag of a `mqtt://` or `mqtts://` broker URL
pub fn broker_address(broker_url: &str) -> Result<(String, u16, bool), MqttError> {
    let invalid = || MqttError::InvalidBrokerUrl(broker_url.to_string());
    let url = Url::parse(broker_url).map_err(|_| invalid())?;
    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(invalid()),
    };
    let host = url.host_str().ok_or_else(invalid)?.to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });
    Ok((host, port, tls))
}

/// Username and password read from the environment variables the config names
fn broker_credentials(config: &QueueSection) -> Option<(String, String)> {
    let username = std::env::var(config.username_env.as_deref()?).ok()?;
    let password = config
        .password_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok())
        .unwrap_or_default();
    Some((username, password))
}

/// Build MQTT options for a listener of `platform`
pub fn configure_mqtt_options(
    platform: &str,
    config: &QueueSection,
) -> Result<MqttOptions, MqttError> {
    let (host, port, tls) = broker_address(&config.broker_url)?;

    // Restarted listeners must not kick out a lingering session of the old process
    let client_id = format!("listener-{platform}-{}", Uuid::new_v4().simple());
    let mut options = MqttOptions::new(client_id, host, port);

    if tls {
        options.set_transport(RumqttcTransport::tls_with_default_config());
    }
    if let Some((username, password)) = broker_credentials(config) {
        options.set_credentials(username, password);
    }

    options.set_keep_alive(Duration::from_secs(60));
    // job payloads and reports outgrow the usual 10KB broker default
    options.set_max_packet_size(Some(256 * 1024));

    Ok(options)
}

/// Routing decision for one event-loop event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Disconnected,
    Other,
}

/// Classify an MQTT event
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    use rumqttc::v5::mqttbytes::v5::Packet;
    match event {
        Event::Incoming(Packet::ConnAck(_)) => EventRoute::ConnectionAcknowledged,
        Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived {
            topic: String::from_utf8_lossy(&publish.topic).to_string(),
            payload: publish.payload.to_vec(),
            retain: publish.retain,
        },
        Event::Incoming(Packet::Disconnect(_)) => EventRoute::Disconnected,
        _ => EventRoute::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_queue_config() -> QueueSection {
        QueueSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            ..QueueSection::default()
        }
    }

    #[test]
    fn test_delay_follows_steps_then_ceiling() {
        let config = ReconnectConfig::default();
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| config.delay_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![25, 50, 100, 250, 250, 250]);
        assert_eq!(config.delay_for(0), config.ceiling);
    }

    #[test]
    fn test_next_attempt_respects_limit() {
        let limited = ReconnectConfig {
            max_attempts: Some(2),
            ..ReconnectConfig::default()
        };
        assert_eq!(limited.next_attempt(0), Some((1, Duration::from_millis(25))));
        assert_eq!(limited.next_attempt(1), Some((2, Duration::from_millis(50))));
        assert_eq!(limited.next_attempt(2), None);

        let unlimited = ReconnectConfig::default();
        assert_eq!(
            unlimited.next_attempt(1000),
            Some((1001, Duration::from_millis(250)))
        );
    }

    #[test]
    fn test_broker_address() {
        assert_eq!(
            broker_address("mqtt://localhost").unwrap(),
            ("localhost".to_string(), 1883, false)
        );
        assert_eq!(
            broker_address("mqtts://broker.example.com").unwrap(),
            ("broker.example.com".to_string(), 8883, true)
        );
        assert_eq!(
            broker_address("mqtt://10.0.0.5:2883").unwrap(),
            ("10.0.0.5".to_string(), 2883, false)
        );
        assert!(matches!(
            broker_address("http://broker:1883"),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options("github", &test_queue_config()).unwrap();
        assert!(options.client_id().starts_with("listener-github-"));

        let mut tls = test_queue_config();
        tls.broker_url = "mqtts://broker.example.com".to_string();
        assert!(configure_mqtt_options("github", &tls).is_ok());
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = test_queue_config();
        config.broker_url = "invalid-url".to_string();
        let result = configure_mqtt_options("github", &config);
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_only_connected_state_can_publish() {
        assert!(ConnectionState::Connected.can_publish());
        assert!(!ConnectionState::Connecting.can_publish());
        assert!(!ConnectionState::Reconnecting(1).can_publish());
        assert!(!ConnectionState::PermanentlyDisconnected("x".into()).can_publish());
    }
}
