//! Health check HTTP server for container orchestration
//!
//! Exposes `/health`, `/ready`, `/live` and `/metrics` for one listener.
//! Readiness means the queue is connected and the encryption key gate has
//! opened, i.e. the listener is actually consuming jobs.

use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::Filter;

const JOB_STALENESS_THRESHOLD_SECONDS: u64 = 300;

/// HTTP health check server
pub struct HealthServer {
    platform: String,
    port: u16,
    queue_connected: AtomicBool,
    consuming: AtomicBool,
}

impl HealthServer {
    pub fn new(platform: impl Into<String>, port: u16) -> Self {
        Self {
            platform: platform.into(),
            port,
            queue_connected: AtomicBool::new(false),
            consuming: AtomicBool::new(false),
        }
    }

    pub fn set_queue_connected(&self, connected: bool) {
        self.queue_connected.store(connected, Ordering::Relaxed);
    }

    /// Mark that the key gate has opened and jobs are being consumed
    pub fn set_consuming(&self, consuming: bool) {
        self.consuming.store(consuming, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.queue_connected.load(Ordering::Relaxed) && self.consuming.load(Ordering::Relaxed)
    }

    /// Route table served by `start`
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - detailed health status
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.health_status();
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(|| async {
            Ok::<_, Infallible>(warp::reply::json(&metrics().get_metrics()))
        });

        // GET /ready - readiness probe
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.is_ready();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live - liveness probe
        let live_route = warp::path("live").and(warp::get()).and_then(|| async {
            Ok::<_, Infallible>(warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            }))
        });

        // GET / - endpoint list
        let root_route = warp::path::end().and(warp::get()).and_then(|| async {
            let endpoints: HashMap<String, String> = [
                ("/health", "Overall health status with detailed checks"),
                ("/metrics", "Dispatch, instance and queue statistics"),
                ("/ready", "Readiness probe"),
                ("/live", "Liveness probe"),
            ]
            .into_iter()
            .map(|(path, description)| (path.to_string(), description.to_string()))
            .collect();
            Ok::<_, Infallible>(warp::reply::json(&ApiDocumentationResponse { endpoints }))
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Serve until the process exits
    pub async fn start(self: Arc<Self>) {
        tracing::info!(platform = %self.platform, "Starting health server on port {}", self.port);
        let routes = self.routes();
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
    }

    fn health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let snapshot = metrics().get_metrics();

        let mut checks = HashMap::new();
        checks.insert("queue".to_string(), self.check_queue(now));
        checks.insert("enc_key".to_string(), self.check_key_gate(now));
        checks.insert(
            "job_activity".to_string(),
            check_job_activity(snapshot.jobs.last_completed, now),
        );

        let overall_healthy = checks.values().all(|check| check.status != "unhealthy");

        HealthStatus {
            status: if overall_healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            platform: self.platform.clone(),
            uptime_seconds: snapshot.lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_queue(&self, now: u64) -> HealthCheck {
        if self.queue_connected.load(Ordering::Relaxed) {
            HealthCheck::new("healthy", "Queue connection established", now)
        } else {
            HealthCheck::new("unhealthy", "Queue connection failed or disconnected", now)
        }
    }

    fn check_key_gate(&self, now: u64) -> HealthCheck {
        if self.consuming.load(Ordering::Relaxed) {
            HealthCheck::new("healthy", "Encryption key set, consuming jobs", now)
        } else {
            HealthCheck::new("unhealthy", "Waiting for encryption key", now)
        }
    }
}

/// Job activity check: idle listeners are healthy, long silences are stale
fn check_job_activity(last_completed: u64, now: u64) -> HealthCheck {
    if last_completed == 0 {
        HealthCheck::new("healthy", "No jobs processed yet", now)
    } else if now.saturating_sub(last_completed) > JOB_STALENESS_THRESHOLD_SECONDS {
        let idle = now.saturating_sub(last_completed);
        HealthCheck::new("stale", &format!("No job activity for {idle} seconds"), now)
    } else {
        HealthCheck::new("healthy", "Recent job activity", now)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn new(status: &str, message: &str, now: u64) -> Self {
        Self {
            status: status.to_string(),
            message: Some(message.to_string()),
            last_check: now,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    platform: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: HashMap<String, String>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
