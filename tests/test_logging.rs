//! Tests for logging configuration and format parsing
//!
//! Tests the pure functions in the logging module that handle
//! log format and level parsing from environment values.

use platform_listener::observability::logging::{init_logging, parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert!(matches!(LogFormat::parse("json"), LogFormat::Json));
    assert!(matches!(LogFormat::parse("PRETTY"), LogFormat::Pretty));
    assert!(matches!(LogFormat::parse("Compact"), LogFormat::Compact));
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    // Invalid formats should default to JSON for production safety
    assert!(matches!(LogFormat::parse("invalid"), LogFormat::Json));
    assert!(matches!(LogFormat::parse(""), LogFormat::Json));
    assert!(matches!(LogFormat::parse("xml"), LogFormat::Json));
}

#[test]
fn test_parse_level() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("WARN"), Level::WARN);
    assert_eq!(parse_level("debug"), Level::DEBUG);
    assert_eq!(parse_level("Trace"), Level::TRACE);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_init_logging_twice_does_not_panic() {
    init_logging(Level::INFO, LogFormat::Compact, false);
    init_logging(Level::DEBUG, LogFormat::Json, true);
}

#[test]
fn test_span_macros_build_spans() {
    let job = platform_listener::job_span!(platform = "github", session_id = "s1", verb = "send");
    let _entered = job.enter();
    let lifecycle = platform_listener::lifecycle_span!(platform = "github", event = "shutdown");
    let _lifecycle = lifecycle.enter();
}
