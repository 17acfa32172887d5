//! Tracing subscriber setup and the listener's span macros
//!
//! Output is selected with `LOG_FORMAT` (`json`, `pretty`, `compact`), the
//! level with `LOG_LEVEL`, and `LOG_SPANS=true` adds span open/close events.
//! A set `RUST_LOG` replaces the computed filter entirely.
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=debug platform-listener --config listener.toml run
//! ```
//!
//! Every job runs inside a `job_dispatch` span carrying `platform`,
//! `session_id` and `verb`, so a single session can be followed through
//! JSON logs by filtering on `span.session_id`.

use std::env;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Crates whose chatter is capped at `warn` unless `RUST_LOG` says otherwise
const QUIET_TARGETS: &[&str] = &["rumqttc", "hyper", "reqwest", "warp"];

/// Subscriber output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// Multi-line, colored
    Pretty,
    /// Single-line, colored, no targets
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Self::Pretty,
            "compact" => Self::Compact,
            _ => Self::Json,
        }
    }
}

/// Map a `LOG_LEVEL` value onto a tracing level; unknown values mean INFO
pub fn parse_level(s: &str) -> Level {
    s.trim().parse::<Level>().unwrap_or(Level::INFO)
}

/// Resolved logging settings
#[derive(Debug, Clone)]
struct LogSettings {
    level: Level,
    format: LogFormat,
    span_events: FmtSpan,
}

impl LogSettings {
    fn new(level: Level, format: LogFormat, include_spans: bool) -> Self {
        let span_events = if include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        Self {
            level,
            format,
            span_events,
        }
    }

    fn from_env() -> Self {
        let level = env::var("LOG_LEVEL")
            .map(|v| parse_level(&v))
            .unwrap_or(Level::INFO);
        let format = env::var("LOG_FORMAT")
            .map(|v| LogFormat::parse(&v))
            .unwrap_or_default();
        let include_spans = env::var("LOG_SPANS")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self::new(level, format, include_spans)
    }

    fn filter(&self) -> EnvFilter {
        if let Ok(directives) = env::var("RUST_LOG") {
            return EnvFilter::new(directives);
        }
        QUIET_TARGETS
            .iter()
            .filter_map(|target| format!("{target}=warn").parse::<Directive>().ok())
            .fold(EnvFilter::new(self.level.as_str()), EnvFilter::add_directive)
    }

    fn install(self) {
        let registry = tracing_subscriber::registry().with(self.filter());
        let layer = fmt::layer().with_span_events(self.span_events);

        let installed = match self.format {
            LogFormat::Json => registry.with(layer.json()).try_init(),
            LogFormat::Pretty => registry.with(layer.pretty().with_ansi(true)).try_init(),
            LogFormat::Compact => registry
                .with(layer.compact().with_ansi(true).with_target(false))
                .try_init(),
        };

        if installed.is_err() {
            tracing::debug!("tracing subscriber already installed, keeping it");
        }
    }
}

/// Install the global subscriber; later calls keep the first one
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    LogSettings::new(level, format, include_spans).install();
}

/// Install the global subscriber from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
pub fn init_default_logging() {
    LogSettings::from_env().install();
}

/// Span wrapping one job from lookup to report
#[macro_export]
macro_rules! job_span {
    ($($field:tt)*) => {
        tracing::info_span!("job_dispatch", $($field)*)
    };
}

/// Span for a queue consumer loop
#[macro_export]
macro_rules! queue_span {
    ($($field:tt)*) => {
        tracing::info_span!("queue_consumer", $($field)*)
    };
}

/// Span for tearing down one session's instance
#[macro_export]
macro_rules! cleanup_span {
    ($($field:tt)*) => {
        tracing::info_span!("session_cleanup", $($field)*)
    };
}

/// Span for startup and shutdown of the listener itself
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("listener_lifecycle", $($field)*)
    };
}

pub use {cleanup_span, job_span, lifecycle_span, queue_span};
