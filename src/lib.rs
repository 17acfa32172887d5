//! Platform Listener
//!
//! The dispatch engine of a protocol gateway. For one external platform, a
//! listener consumes normalized jobs from a shared work queue, routes each
//! job to a per-session platform handler, reports the outcome back to the
//! session, and manages handler lifecycles across many concurrent sessions.
//!
//! # Overview
//!
//! - [`queue`]: the work-queue contract with in-memory and MQTT backends
//! - [`session`]: the session collaborator contract and an in-process store
//! - [`platform`]: the platform handler contract and the built-in modules
//! - [`listener`]: key gate, consumer, registry, dispatcher, reporter and
//!   cleanup coordinator
//! - [`observability`]: logging, metrics and health endpoints
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use platform_listener::{Listener, ListenerConfig, LocalSessionStore, MemoryQueue, PlatformCatalog};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ListenerConfig::for_platform("github");
//! let queue = Arc::new(MemoryQueue::new());
//! let sessions = Arc::new(LocalSessionStore::with_enc_key(config.channels(), queue.clone(), "key"));
//!
//! let listener = Arc::new(Listener::new(
//!     config.clone(),
//!     &PlatformCatalog::builtin(&config),
//!     queue,
//!     sessions,
//! )?);
//! listener.start()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod listener;
pub mod observability;
pub mod platform;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod testing;

pub use config::*;
pub use error::{ListenerError, ListenerResult};
pub use listener::{Listener, ListenerState, ShutdownReport};
pub use platform::{PlatformCatalog, PlatformHandler, VerbError};
pub use protocol::*;
pub use queue::{JobQueue, MemoryQueue, MqttQueue};
pub use session::{LocalSessionStore, SessionStore};
