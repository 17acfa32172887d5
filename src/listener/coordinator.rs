//! Session cleanup and listener shutdown
//!
//! Session-scoped cleanup detaches the session's downstream clients and
//! releases its platform instance. Full shutdown tears down the session
//! store and cleans up every instance concurrently, waiting at most until
//! the shutdown deadline before giving up on stragglers.

use super::fatal::describe_join_error;
use super::registry::InstanceRegistry;
use crate::observability::metrics::metrics;
use crate::session::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

/// What a full shutdown achieved before returning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub sessions: Vec<String>,
    /// Cleanups that finished, successfully or not
    pub completed: usize,
    pub timed_out: bool,
}

/// Tears down platform instances
pub struct CleanupCoordinator {
    platform: String,
    registry: Arc<InstanceRegistry>,
    sessions: Arc<dyn SessionStore>,
    deadline: Duration,
}

impl CleanupCoordinator {
    pub fn new(
        platform: &str,
        registry: Arc<InstanceRegistry>,
        sessions: Arc<dyn SessionStore>,
        deadline: Duration,
    ) -> Self {
        Self {
            platform: platform.to_string(),
            registry,
            sessions,
            deadline,
        }
    }

    /// Release everything held for one session
    ///
    /// Errors are logged, never returned.
    pub async fn cleanup_session(&self, session_id: &str) {
        let span = crate::cleanup_span!(platform = %self.platform, session_id = %session_id);
        async {
            debug!("Session cleanup requested");
            match self.sessions.get(session_id, false).await {
                Ok(session) => match session.platform_session(&self.platform) {
                    Ok(view) => {
                        for key in view.client_manager.keys() {
                            view.client_manager.remove_listeners(&key, &self.platform);
                            debug!(client = %key, "Removing client");
                            view.client_manager.remove(&key);
                        }
                    }
                    Err(e) => warn!(error = %e, "No platform view for session"),
                },
                Err(e) => info!(error = %e, "No session exists"),
            }

            if let Err(e) = self.cleanup_platform(session_id).await {
                error!(error = %e, "Error cleaning up platform instance");
            }
        }
        .instrument(span)
        .await
    }

    /// Remove the session's instance and run its cleanup, if it has one
    ///
    /// Returns `Ok(false)` when no instance was registered.
    pub async fn cleanup_platform(&self, session_id: &str) -> Result<bool, String> {
        cleanup_instance(&self.platform, &self.registry, session_id).await
    }

    /// Clean up `session_ids`, or every registered session when `None`
    ///
    /// The session store is destroyed first. Cleanups run concurrently; once
    /// the deadline passes the remaining ones are left running and the
    /// shutdown proceeds.
    pub async fn shutdown(&self, session_ids: Option<Vec<String>>) -> ShutdownReport {
        let span = crate::lifecycle_span!(platform = %self.platform, event = "shutdown");
        self.run_shutdown(session_ids).instrument(span).await
    }

    async fn run_shutdown(&self, session_ids: Option<Vec<String>>) -> ShutdownReport {
        let sessions = session_ids.unwrap_or_else(|| self.registry.session_ids());
        info!(sessions = sessions.len(), "Shutting down platform instances");

        self.sessions.destroy().await;

        let mut cleanups = JoinSet::new();
        for session_id in sessions.iter().cloned() {
            let platform = self.platform.clone();
            let registry = self.registry.clone();
            cleanups.spawn(async move {
                let result = cleanup_instance(&platform, &registry, &session_id).await;
                (session_id, result)
            });
        }

        let total = sessions.len();
        let mut completed = 0;
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        while completed < total {
            tokio::select! {
                joined = cleanups.join_next() => match joined {
                    Some(Ok((session_id, Err(e)))) => {
                        error!(session_id = %session_id, error = %e, "Error cleaning up session");
                        completed += 1;
                    }
                    Some(Ok(_)) => completed += 1,
                    Some(Err(join_error)) => {
                        error!(error = %describe_join_error(join_error), "Cleanup task failed");
                        completed += 1;
                    }
                    None => break,
                },
                _ = &mut deadline => break,
            }
            debug!(completed, total, "Platform instance cleanup progress");
        }

        let timed_out = completed < total;
        if timed_out {
            metrics().shutdown_timed_out();
            error!(
                completed,
                total, "Platform instance cleanup timed out, proceeding with shutdown"
            );
            cleanups.detach_all();
        } else {
            info!(total, "Shutdown complete");
        }

        ShutdownReport {
            sessions,
            completed,
            timed_out,
        }
    }
}

async fn cleanup_instance(
    platform: &str,
    registry: &InstanceRegistry,
    session_id: &str,
) -> Result<bool, String> {
    let Some(handler) = registry.remove(session_id).await else {
        debug!(platform, session_id, "No platform instance to clean up");
        return Ok(false);
    };

    if !handler.has_cleanup() {
        metrics().instance_cleaned_up(true);
        return Ok(true);
    }

    debug!(platform, session_id, "Cleaning up platform instance");
    match handler.cleanup().await {
        Ok(()) => {
            metrics().instance_cleaned_up(true);
            Ok(true)
        }
        Err(e) => {
            metrics().instance_cleaned_up(false);
            Err(e.to_string())
        }
    }
}
