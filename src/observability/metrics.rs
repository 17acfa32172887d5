//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! job dispatch, platform instances, the queue connection and the listener
//! lifecycle.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Job dispatch
    jobs_received: AtomicU64,
    jobs_malformed: AtomicU64,
    jobs_rejected: AtomicU64,
    jobs_in_flight: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    verbs_unsupported: AtomicU64,
    dispatch_times: Mutex<Vec<u64>>, // in milliseconds
    verb_stats: Mutex<HashMap<String, VerbStats>>,

    // Platform instances
    instances_created: AtomicU64,
    instance_init_failures: AtomicU64,
    instances_cleaned_up: AtomicU64,
    cleanup_failures: AtomicU64,

    // Queue
    queue_connected: AtomicBool,
    queue_connection_attempts: AtomicU64,
    queue_messages_received: AtomicU64,
    queue_messages_published: AtomicU64,
    queue_publish_failures: AtomicU64,
    queue_errors: AtomicU64,

    // Lifecycle
    listener_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
    enc_key_ready: AtomicBool,
    fatal_escalations: AtomicU64,
    shutdown_timeouts: AtomicU64,
    last_job_completed: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            jobs_received: AtomicU64::new(0),
            jobs_malformed: AtomicU64::new(0),
            jobs_rejected: AtomicU64::new(0),
            jobs_in_flight: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            verbs_unsupported: AtomicU64::new(0),
            dispatch_times: Mutex::new(Vec::new()),
            verb_stats: Mutex::new(HashMap::new()),
            instances_created: AtomicU64::new(0),
            instance_init_failures: AtomicU64::new(0),
            instances_cleaned_up: AtomicU64::new(0),
            cleanup_failures: AtomicU64::new(0),
            queue_connected: AtomicBool::new(false),
            queue_connection_attempts: AtomicU64::new(0),
            queue_messages_received: AtomicU64::new(0),
            queue_messages_published: AtomicU64::new(0),
            queue_publish_failures: AtomicU64::new(0),
            queue_errors: AtomicU64::new(0),
            listener_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            state_transitions: AtomicU64::new(0),
            enc_key_ready: AtomicBool::new(false),
            fatal_escalations: AtomicU64::new(0),
            shutdown_timeouts: AtomicU64::new(0),
            last_job_completed: AtomicU64::new(0),
        }
    }

    // Job dispatch metrics
    pub fn job_received(&self) {
        self.jobs_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_malformed(&self) {
        self.jobs_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_rejected(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_started(&self) {
        self.jobs_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self, verb: &str, duration: Duration, success: bool) {
        if success {
            self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.jobs_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.last_job_completed
            .store(current_timestamp(), Ordering::Relaxed);

        let millis = duration.as_millis() as u64;
        if let Ok(mut times) = self.dispatch_times.lock() {
            push_bounded(&mut times, millis);
        }
        if let Ok(mut stats) = self.verb_stats.lock() {
            stats
                .entry(verb.to_string())
                .or_default()
                .record(millis, success);
        }
    }

    pub fn verb_unsupported(&self) {
        self.verbs_unsupported.fetch_add(1, Ordering::Relaxed);
    }

    // Platform instance metrics
    pub fn instance_created(&self) {
        self.instances_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn instance_init_failed(&self) {
        self.instance_init_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn instance_cleaned_up(&self, success: bool) {
        self.instances_cleaned_up.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Queue metrics
    pub fn queue_connection_attempt(&self) {
        self.queue_connection_attempts
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_connected(&self, connected: bool) {
        self.queue_connected.store(connected, Ordering::Relaxed);
    }

    pub fn queue_message_received(&self) {
        self.queue_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_message_published(&self) {
        self.queue_messages_published
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_publish_failed(&self) {
        self.queue_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_error(&self) {
        self.queue_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_listener_state(&self, state: &str) {
        if let Ok(mut current_state) = self.listener_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    pub fn set_enc_key_ready(&self, ready: bool) {
        self.enc_key_ready.store(ready, Ordering::Relaxed);
    }

    pub fn fatal_escalation(&self) {
        self.fatal_escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shutdown_timed_out(&self) {
        self.shutdown_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.jobs_received,
            &self.jobs_malformed,
            &self.jobs_rejected,
            &self.jobs_in_flight,
            &self.jobs_succeeded,
            &self.jobs_failed,
            &self.verbs_unsupported,
            &self.instances_created,
            &self.instance_init_failures,
            &self.instances_cleaned_up,
            &self.cleanup_failures,
            &self.queue_connection_attempts,
            &self.queue_messages_received,
            &self.queue_messages_published,
            &self.queue_publish_failures,
            &self.queue_errors,
            &self.state_transitions,
            &self.fatal_escalations,
            &self.shutdown_timeouts,
            &self.last_job_completed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.queue_connected.store(false, Ordering::Relaxed);
        self.enc_key_ready.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);

        if let Ok(mut times) = self.dispatch_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.verb_stats.lock() {
            stats.clear();
        }
        if let Ok(mut state) = self.listener_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Average and percentiles of recent dispatch times (pure function)
    fn calculate_dispatch_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.dispatch_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted_times = times.clone();
        sorted_times.sort_unstable();
        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
            percentile(&sorted_times, 99.0),
        )
    }

    fn verb_snapshots(&self) -> HashMap<String, VerbStatsSnapshot> {
        self.verb_stats
            .lock()
            .map(|stats| {
                stats
                    .iter()
                    .map(|(verb, stats)| (verb.clone(), stats.snapshot()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_dispatch_time_ms, p50, p95, p99) = self.calculate_dispatch_time_statistics();
        let current_state = self
            .listener_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            jobs: JobMetrics {
                received: self.jobs_received.load(Ordering::Relaxed),
                malformed: self.jobs_malformed.load(Ordering::Relaxed),
                rejected: self.jobs_rejected.load(Ordering::Relaxed),
                in_flight: self.jobs_in_flight.load(Ordering::Relaxed),
                succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
                failed: self.jobs_failed.load(Ordering::Relaxed),
                unsupported_verbs: self.verbs_unsupported.load(Ordering::Relaxed),
                avg_dispatch_time_ms,
                dispatch_time_p50_ms: p50,
                dispatch_time_p95_ms: p95,
                dispatch_time_p99_ms: p99,
                verbs: self.verb_snapshots(),
                last_completed: self.last_job_completed.load(Ordering::Relaxed),
            },
            instances: InstanceMetrics {
                created: self.instances_created.load(Ordering::Relaxed),
                init_failures: self.instance_init_failures.load(Ordering::Relaxed),
                cleaned_up: self.instances_cleaned_up.load(Ordering::Relaxed),
                cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            },
            queue: QueueMetrics {
                connected: self.queue_connected.load(Ordering::Relaxed),
                connection_attempts: self.queue_connection_attempts.load(Ordering::Relaxed),
                messages_received: self.queue_messages_received.load(Ordering::Relaxed),
                messages_published: self.queue_messages_published.load(Ordering::Relaxed),
                publish_failures: self.queue_publish_failures.load(Ordering::Relaxed),
                errors: self.queue_errors.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state,
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                enc_key_ready: self.enc_key_ready.load(Ordering::Relaxed),
                fatal_escalations: self.fatal_escalations.load(Ordering::Relaxed),
                shutdown_timeouts: self.shutdown_timeouts.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Per-verb statistics (with timing data)
#[derive(Debug, Default)]
struct VerbStats {
    invocations: u64,
    failures: u64,
    times: Vec<u64>, // milliseconds
}

impl VerbStats {
    fn record(&mut self, millis: u64, success: bool) {
        self.invocations += 1;
        if !success {
            self.failures += 1;
        }
        push_bounded(&mut self.times, millis);
    }

    fn snapshot(&self) -> VerbStatsSnapshot {
        let avg_time_ms = if self.times.is_empty() {
            0.0
        } else {
            self.times.iter().sum::<u64>() as f64 / self.times.len() as f64
        };
        let success_rate = if self.invocations == 0 {
            0.0
        } else {
            (self.invocations - self.failures) as f64 / self.invocations as f64
        };
        VerbStatsSnapshot {
            invocations: self.invocations,
            failures: self.failures,
            avg_time_ms,
            success_rate,
        }
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub jobs: JobMetrics,
    pub instances: InstanceMetrics,
    pub queue: QueueMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct JobMetrics {
    pub received: u64,
    pub malformed: u64,
    pub rejected: u64,
    pub in_flight: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub unsupported_verbs: u64,
    pub avg_dispatch_time_ms: f64,
    pub dispatch_time_p50_ms: f64,
    pub dispatch_time_p95_ms: f64,
    pub dispatch_time_p99_ms: f64,
    pub verbs: HashMap<String, VerbStatsSnapshot>,
    pub last_completed: u64,
}

#[derive(Debug, Serialize)]
pub struct VerbStatsSnapshot {
    pub invocations: u64,
    pub failures: u64,
    pub avg_time_ms: f64,
    pub success_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct InstanceMetrics {
    pub created: u64,
    pub init_failures: u64,
    pub cleaned_up: u64,
    pub cleanup_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct QueueMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub messages_received: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub errors: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
    pub enc_key_ready: bool,
    pub fatal_escalations: u64,
    pub shutdown_timeouts: u64,
}

// Helper functions
fn push_bounded(samples: &mut Vec<u64>, value: u64) {
    samples.push(value);
    if samples.len() > MAX_SAMPLES {
        samples.remove(0);
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}
