//! Per-session platform instance registry
//!
//! Holds at most one handler per session. A new handler is registered in
//! the map before its `init` runs, so concurrent first jobs for a session
//! find the same slot and wait on the same initialization outcome.

use super::fatal::describe_join_error;
use crate::observability::metrics::metrics;
use crate::platform::{PlatformFactory, PlatformHandler};
use crate::session::SessionStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Why an instance could not be resolved
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("Failed to construct {platform} instance: {message}")]
    Construction {
        platform: String,
        message: String,
        /// The factory panicked instead of returning an error
        unexpected: bool,
    },

    #[error("Failed to initialize {platform} instance for session {session_id}: {message}")]
    InitFailed {
        platform: String,
        session_id: String,
        message: String,
        /// `init` panicked instead of returning an error
        unexpected: bool,
    },
}

impl RegistryError {
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            RegistryError::Construction {
                unexpected: true,
                ..
            } | RegistryError::InitFailed {
                unexpected: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    Construction,
    Init,
}

#[derive(Debug, Clone)]
struct InitFailure {
    stage: Stage,
    message: String,
    unexpected: bool,
}

impl InitFailure {
    fn structured(stage: Stage, message: String) -> Self {
        Self {
            stage,
            message,
            unexpected: false,
        }
    }
}

type SlotOutcome = Result<Arc<dyn PlatformHandler>, InitFailure>;

/// Registry entry for one session
///
/// The handler is built and initialized by whichever job reaches the slot
/// first; later jobs wait on the same cell.
struct InstanceSlot {
    ready: OnceCell<SlotOutcome>,
}

impl InstanceSlot {
    fn handler(&self) -> Option<Arc<dyn PlatformHandler>> {
        match self.ready.get() {
            Some(Ok(handler)) => Some(handler.clone()),
            _ => None,
        }
    }
}

/// Map of session id to initialized platform handler
pub struct InstanceRegistry {
    platform: String,
    factory: PlatformFactory,
    sessions: Arc<dyn SessionStore>,
    instances: Mutex<HashMap<String, Arc<InstanceSlot>>>,
}

impl InstanceRegistry {
    pub fn new(platform: &str, factory: PlatformFactory, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            platform: platform.to_string(),
            factory,
            sessions,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn lock_instances(&self) -> MutexGuard<'_, HashMap<String, Arc<InstanceSlot>>> {
        // Map operations never panic while holding the lock; recover the data if one did
        self.instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Find the handler for `session_id`
    ///
    /// With `create` unset only a handler whose `init` already completed is
    /// returned. With `create` set a missing handler is registered, then
    /// constructed and initialized; the call returns once initialization has
    /// completed. Construction and `init` run on a separate task so a panic
    /// in platform code surfaces as an unexpected error.
    pub async fn resolve(
        &self,
        session_id: &str,
        create: bool,
    ) -> Result<Option<Arc<dyn PlatformHandler>>, RegistryError> {
        let slot = {
            let mut instances = self.lock_instances();
            match instances.get(session_id) {
                Some(slot) => slot.clone(),
                None if !create => return Ok(None),
                None => {
                    let slot = Arc::new(InstanceSlot {
                        ready: OnceCell::new(),
                    });
                    instances.insert(session_id.to_string(), slot.clone());
                    debug!(platform = %self.platform, session_id, "Registered new platform instance");
                    slot
                }
            }
        };

        if !create {
            return Ok(slot.handler());
        }

        let outcome = slot
            .ready
            .get_or_init(|| self.initialize(session_id))
            .await;

        match outcome {
            Ok(handler) => Ok(Some(handler.clone())),
            Err(failure) => {
                self.discard(session_id, &slot);
                Err(self.registry_error(session_id, failure))
            }
        }
    }

    fn registry_error(&self, session_id: &str, failure: &InitFailure) -> RegistryError {
        match failure.stage {
            Stage::Construction => RegistryError::Construction {
                platform: self.platform.clone(),
                message: failure.message.clone(),
                unexpected: failure.unexpected,
            },
            Stage::Init => RegistryError::InitFailed {
                platform: self.platform.clone(),
                session_id: session_id.to_string(),
                message: failure.message.clone(),
                unexpected: failure.unexpected,
            },
        }
    }

    async fn initialize(&self, session_id: &str) -> SlotOutcome {
        let factory = self.factory.clone();
        let handler = match tokio::spawn(async move { factory() }).await {
            Ok(Ok(handler)) => handler,
            Ok(Err(e)) => {
                warn!(platform = %self.platform, session_id, error = %e, "Platform construction failed");
                return Err(InitFailure::structured(Stage::Construction, e.to_string()));
            }
            Err(join_error) => {
                return Err(InitFailure {
                    stage: Stage::Construction,
                    message: describe_join_error(join_error),
                    unexpected: true,
                });
            }
        };
        metrics().instance_created();

        let lookup_failed =
            |e: String| InitFailure::structured(Stage::Init, format!("failed getting platform session: {e}"));
        let session = self
            .sessions
            .get(session_id, true)
            .await
            .map_err(|e| lookup_failed(e.to_string()))?;
        let context = session
            .platform_session(&self.platform)
            .map_err(|e| lookup_failed(e.to_string()))?;

        info!(platform = %self.platform, session_id, "Initializing platform instance");
        let task_handler = handler.clone();
        let result = tokio::spawn(async move { task_handler.init(context).await }).await;

        match result {
            Ok(Ok(())) => Ok(handler),
            Ok(Err(e)) => {
                metrics().instance_init_failed();
                warn!(platform = %self.platform, session_id, error = %e, "Platform init rejected");
                Err(InitFailure::structured(Stage::Init, e.to_string()))
            }
            Err(join_error) => {
                metrics().instance_init_failed();
                Err(InitFailure {
                    stage: Stage::Init,
                    message: describe_join_error(join_error),
                    unexpected: true,
                })
            }
        }
    }

    /// Remove `slot` if it is still the one registered for `session_id`
    fn discard(&self, session_id: &str, slot: &Arc<InstanceSlot>) {
        let mut instances = self.lock_instances();
        if instances
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            instances.remove(session_id);
            debug!(platform = %self.platform, session_id, "Discarded failed platform instance");
        }
    }

    /// Take the handler for `session_id` out of the registry
    ///
    /// An `init` still in flight is awaited first, so `cleanup` never runs
    /// alongside it. A slot whose initialization had not started is closed
    /// instead: the job that created it fails and nothing needs cleaning.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<dyn PlatformHandler>> {
        let slot = self.lock_instances().remove(session_id)?;
        let outcome = slot
            .ready
            .get_or_init(|| async {
                Err(InitFailure::structured(
                    Stage::Init,
                    "session was cleaned up before initialization".to_string(),
                ))
            })
            .await;
        outcome.as_ref().ok().cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock_instances().contains_key(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock_instances().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock_instances().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_instances().is_empty()
    }
}
