//! Listener configuration
//!
//! One listener process serves exactly one platform. The configuration names
//! that platform, the queue it consumes from, and the timing constants used by
//! the key-readiness gate and the shutdown coordinator.

use crate::protocol::channels::{validate_platform_name, ChannelNames};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main listener configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerConfig {
    #[serde(default)]
    pub listener: ListenerSection,
    pub platform: PlatformSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub platforms: PlatformsSection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Listener section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ListenerSection {
    /// Namespace prefix shared by every channel of this gateway
    pub hub_id: Option<String>,
    /// Environment variable that may carry the encryption key at startup
    pub enc_key_env: Option<String>,
}

/// Platform served by this listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformSection {
    /// Platform name (must match [a-zA-Z0-9._-]+)
    pub name: String,
    /// Catalog locator of the platform module (defaults to the name)
    pub location: Option<String>,
    /// Verbs advertised by this platform
    #[serde(default)]
    pub verbs: Vec<String>,
}

impl PlatformSection {
    /// Locator used to look the module up in the platform catalog
    pub fn locator(&self) -> &str {
        self.location.as_deref().unwrap_or(&self.name)
    }
}

/// Queue backend selection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Mqtt,
    Memory,
}

/// Queue section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSection {
    #[serde(default)]
    pub backend: QueueBackend,
    /// Broker URL with protocol and port
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            broker_url: default_broker_url(),
            username_env: None,
            password_env: None,
        }
    }
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

/// Timing constants for the gate, the consumer and the coordinator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingSection {
    /// Delay before the key gate is first checked
    #[serde(default = "default_key_initial_delay")]
    pub key_initial_delay_ms: u64,
    /// Re-check interval while the key is not yet set
    #[serde(default = "default_key_poll_interval")]
    pub key_poll_interval_ms: u64,
    /// Interval between shutdown completion checks
    #[serde(default = "default_shutdown_poll_interval")]
    pub shutdown_poll_interval_ms: u64,
    /// Checks before shutdown gives up waiting on cleanups
    #[serde(default = "default_shutdown_max_rounds")]
    pub shutdown_max_rounds: u32,
    /// Pause after a queue error before popping again
    #[serde(default = "default_queue_retry_delay")]
    pub queue_retry_delay_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            key_initial_delay_ms: default_key_initial_delay(),
            key_poll_interval_ms: default_key_poll_interval(),
            shutdown_poll_interval_ms: default_shutdown_poll_interval(),
            shutdown_max_rounds: default_shutdown_max_rounds(),
            queue_retry_delay_ms: default_queue_retry_delay(),
        }
    }
}

impl TimingSection {
    pub fn key_initial_delay(&self) -> Duration {
        Duration::from_millis(self.key_initial_delay_ms)
    }

    pub fn key_poll_interval(&self) -> Duration {
        Duration::from_millis(self.key_poll_interval_ms)
    }

    /// Upper bound on how long full shutdown waits for cleanups
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_interval_ms)
            .saturating_mul(self.shutdown_max_rounds)
    }

    pub fn queue_retry_delay(&self) -> Duration {
        Duration::from_millis(self.queue_retry_delay_ms)
    }
}

fn default_key_initial_delay() -> u64 {
    1000
}

fn default_key_poll_interval() -> u64 {
    500
}

fn default_shutdown_poll_interval() -> u64 {
    1000
}

fn default_shutdown_max_rounds() -> u32 {
    5
}

fn default_queue_retry_delay() -> u64 {
    250
}

/// Per-adapter settings for the built-in platforms
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlatformsSection {
    #[serde(default)]
    pub github: GithubSection,
}

/// GitHub adapter settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GithubSection {
    #[serde(default = "default_github_base_url")]
    pub base_url: String,
    #[serde(default = "default_github_timeout")]
    pub timeout_secs: u64,
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            base_url: default_github_base_url(),
            timeout_secs: default_github_timeout(),
        }
    }
}

fn default_github_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_github_timeout() -> u64 {
    30
}

/// Health server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
        }
    }
}

fn default_health_port() -> u16 {
    8080
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid platform name: {0}")]
    InvalidPlatformName(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ListenerConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ListenerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_platform_name(&self.platform.name)
            .map_err(|e| ConfigError::InvalidPlatformName(format!("{}: {e}", self.platform.name)))?;

        if self.timing.shutdown_max_rounds == 0 {
            return Err(ConfigError::InvalidConfig(
                "timing.shutdown_max_rounds must be at least 1".to_string(),
            ));
        }
        if self.timing.shutdown_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "timing.shutdown_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.timing.key_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "timing.key_poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Channel names for the configured platform
    pub fn channels(&self) -> ChannelNames {
        ChannelNames::new(self.listener.hub_id.as_deref(), &self.platform.name)
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name
            .and_then(|name| std::env::var(name).ok())
            .filter(|value| !value.is_empty())
    }

    /// Encryption key supplied through the environment, if any
    pub fn get_enc_key(&self) -> Option<String> {
        Self::get_env_var_optional(self.listener.enc_key_env.as_ref())
    }

    /// Queue username from environment variable
    pub fn get_queue_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.queue.username_env.as_ref())
    }

    /// Queue password from environment variable
    pub fn get_queue_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.queue.password_env.as_ref())
    }

    /// Minimal configuration for the given platform with fast timings
    pub fn for_platform(name: &str) -> Self {
        Self {
            listener: ListenerSection::default(),
            platform: PlatformSection {
                name: name.to_string(),
                location: None,
                verbs: Vec::new(),
            },
            queue: QueueSection {
                backend: QueueBackend::Memory,
                ..QueueSection::default()
            },
            timing: TimingSection {
                key_initial_delay_ms: 0,
                key_poll_interval_ms: 10,
                shutdown_poll_interval_ms: 20,
                shutdown_max_rounds: 5,
                queue_retry_delay_ms: 10,
            },
            platforms: PlatformsSection::default(),
            health: HealthSection::default(),
        }
    }
}
