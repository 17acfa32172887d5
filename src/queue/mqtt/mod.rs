//! MQTT-backed queue
//!
//! Each queue channel maps onto an MQTT topic of the same name. Incoming
//! publishes are buffered per topic until the consumer pops them; pushes are
//! published with QoS 1.

pub mod client;
pub mod connection;

pub use client::MqttQueue;
pub use connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
