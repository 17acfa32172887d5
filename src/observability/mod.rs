//! Observability for the platform listener
//!
//! Structured logging, a global metrics collector and optional HTTP health
//! endpoints.

pub mod health;
pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{cleanup_span, job_span, lifecycle_span, queue_span};
