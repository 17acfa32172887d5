//! Key-readiness gate
//!
//! Job consumption waits until the session store reports the encryption
//! key as set. Key changes are awaited on the store's watch channel when it
//! has one, with a poll interval as a fallback.

use crate::session::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

pub struct KeyReadinessGate {
    sessions: Arc<dyn SessionStore>,
    initial_delay: Duration,
    poll_interval: Duration,
}

impl KeyReadinessGate {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        initial_delay: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            sessions,
            initial_delay,
            poll_interval,
        }
    }

    /// Resolve once the key is set
    ///
    /// Returns `false` if `shutdown` fired first.
    pub async fn wait(&self, mut shutdown: watch::Receiver<bool>) -> bool {
        let mut changes = self.sessions.enc_key_changes();

        tokio::select! {
            _ = tokio::time::sleep(self.initial_delay) => {}
            _ = wait_for_shutdown(&mut shutdown) => return false,
        }

        loop {
            if self.sessions.enc_key_set() {
                info!("Encryption key set, initialization complete");
                return true;
            }
            debug!("Encryption key not yet set, delaying");

            tokio::select! {
                changed = key_changed(changes.as_mut()) => {
                    if !changed {
                        // Sender gone; fall back to polling
                        changes = None;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = wait_for_shutdown(&mut shutdown) => return false,
            }
        }
    }
}

async fn key_changed(changes: Option<&mut watch::Receiver<bool>>) -> bool {
    match changes {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

/// Resolves when `shutdown` becomes true or its sender is dropped
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockSessionStore;
    use std::time::Instant;

    fn gate(store: Arc<MockSessionStore>, poll: Duration) -> KeyReadinessGate {
        KeyReadinessGate::new(store, Duration::from_millis(5), poll)
    }

    #[tokio::test]
    async fn test_opens_immediately_when_key_set() {
        let store = Arc::new(MockSessionStore::new());
        let (_tx, rx) = watch::channel(false);
        assert!(gate(store, Duration::from_secs(10)).wait(rx).await);
    }

    #[tokio::test]
    async fn test_opens_on_key_change_without_waiting_for_poll() {
        let store = Arc::new(MockSessionStore::without_key());
        let (_tx, rx) = watch::channel(false);
        let gate = gate(store.clone(), Duration::from_secs(30));

        let setter = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            setter.set_enc_key(true);
        });

        let started = Instant::now();
        assert!(gate.wait(rx).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_shutdown_releases_gate() {
        let store = Arc::new(MockSessionStore::without_key());
        let (tx, rx) = watch::channel(false);
        let gate = gate(store, Duration::from_millis(10));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        });

        assert!(!gate.wait(rx).await);
    }
}
