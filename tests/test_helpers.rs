//! Test helpers and utilities for integration tests

use platform_listener::config::ListenerConfig;
use platform_listener::listener::Listener;
use platform_listener::platform::PlatformCatalog;
use platform_listener::protocol::JobReport;
use platform_listener::queue::{JobQueue, MemoryQueue};
use platform_listener::session::LocalSessionStore;
use platform_listener::testing::mocks::MockPlatform;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const PLATFORM: &str = "mock";

/// Listener configuration for the mock platform with fast timings
#[allow(dead_code)]
pub fn test_config() -> ListenerConfig {
    ListenerConfig::for_platform(PLATFORM)
}

/// Catalog serving `platform` under the `mock` locator
#[allow(dead_code)]
pub fn mock_catalog(platform: &Arc<MockPlatform>) -> PlatformCatalog {
    let factory = platform.factory();
    let mut catalog = PlatformCatalog::new();
    catalog.register(PLATFORM, move || factory());
    catalog
}

/// A listener wired to an in-memory queue and an in-process session store
#[allow(dead_code)]
pub struct Harness {
    pub platform: Arc<MockPlatform>,
    pub queue: Arc<MemoryQueue>,
    pub sessions: Arc<LocalSessionStore>,
    pub listener: Arc<Listener>,
}

#[allow(dead_code)]
impl Harness {
    /// Build a harness; the session store has the key when `enc_key` is set
    pub fn new(platform: Arc<MockPlatform>, enc_key: Option<&str>) -> Self {
        let config = test_config();
        let queue = Arc::new(MemoryQueue::new());
        let sessions = Arc::new(match enc_key {
            Some(key) => LocalSessionStore::with_enc_key(config.channels(), queue.clone(), key),
            None => LocalSessionStore::new(config.channels(), queue.clone()),
        });
        let listener = Arc::new(
            Listener::new(
                config,
                &mock_catalog(&platform),
                queue.clone(),
                sessions.clone(),
            )
            .unwrap(),
        );
        Self {
            platform,
            queue,
            sessions,
            listener,
        }
    }

    pub async fn push_job(&self, job: Value) {
        let channel = self.listener.channels().incoming.clone();
        self.queue
            .push(&channel, serde_json::to_vec(&job).unwrap())
            .await
            .unwrap();
    }

    pub async fn push_subsystem(&self, message: Value) {
        let channel = self.listener.channels().subsystem.clone();
        self.queue
            .push(&channel, serde_json::to_vec(&message).unwrap())
            .await
            .unwrap();
    }

    /// Next report delivered to `session_id`, if one arrives in time
    pub async fn next_report(&self, session_id: &str, timeout: Duration) -> Option<JobReport> {
        let channel = self.listener.channels().outgoing(session_id);
        let payload = self.queue.pop_timeout(&channel, timeout).await?;
        serde_json::from_slice(&payload).ok()
    }
}

/// Poll `condition` until it holds or `timeout` passes
#[allow(dead_code)]
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
