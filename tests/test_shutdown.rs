//! Cleanup and shutdown through a running listener

mod test_helpers;

use platform_listener::listener::ListenerState;
use platform_listener::session::SessionStore;
use platform_listener::testing::mocks::{CleanupBehavior, MockPlatform, VerbBehavior};
use serde_json::json;
use std::time::{Duration, Instant};
use test_helpers::*;

const WAIT: Duration = Duration::from_secs(2);

async fn started_with_sessions(platform: std::sync::Arc<MockPlatform>, sids: &[&str]) -> Harness {
    platform.on_verb("send", VerbBehavior::Succeed(json!({})));
    let harness = Harness::new(platform, Some("key"));
    harness.listener.start().unwrap();
    for sid in sids {
        harness
            .push_job(json!({"sessionId": sid, "verb": "send", "object": {}}))
            .await;
        assert!(harness.next_report(sid, WAIT).await.is_some());
    }
    harness
}

#[tokio::test]
async fn test_session_cleanup_event_removes_clients_and_instance() {
    let platform = MockPlatform::new();
    platform.with_cleanup(CleanupBehavior::Succeed);
    let harness = started_with_sessions(platform.clone(), &["s1", "s2"]).await;

    let view = harness
        .sessions
        .get("s1", false)
        .await
        .unwrap()
        .platform_session(PLATFORM)
        .unwrap();
    view.client_manager.register("alice@example.org", PLATFORM);

    harness
        .push_subsystem(json!({"verb": "cleanup", "object": {"sids": ["s1"]}}))
        .await;

    let registry = harness.listener.registry().clone();
    assert!(eventually(WAIT, || !registry.contains("s1")).await);
    assert!(eventually(WAIT, || platform.cleanup_calls() == 1).await);
    assert!(view.client_manager.is_empty());
    assert!(registry.contains("s2"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(platform.cleanup_calls(), 1);
    assert_eq!(harness.listener.state(), ListenerState::Consuming);
}

#[tokio::test]
async fn test_full_shutdown_bounded_when_cleanup_hangs() {
    let platform = MockPlatform::new();
    platform.with_cleanup(CleanupBehavior::Hang);
    let harness = started_with_sessions(platform.clone(), &["a", "b"]).await;

    let started = Instant::now();
    let report = harness.listener.shutdown(None).await;

    assert!(report.timed_out);
    assert_eq!(report.sessions, vec!["a", "b"]);
    // 100ms deadline from the test config
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(harness.listener.state(), ListenerState::Stopped);
    assert!(harness.listener.registry().is_empty());
    assert_eq!(platform.cleanup_calls(), 2);
}

#[tokio::test]
async fn test_shutdown_stops_consuming() {
    let platform = MockPlatform::new();
    let harness = started_with_sessions(platform.clone(), &["s1"]).await;

    let report = harness.listener.shutdown(None).await;
    assert!(!report.timed_out);
    assert_eq!(report.completed, 1);

    harness
        .push_job(json!({"sessionId": "s1", "verb": "send", "object": {}}))
        .await;
    assert!(harness
        .next_report("s1", Duration::from_millis(100))
        .await
        .is_none());
    assert_eq!(platform.invocations().len(), 1);
}

#[tokio::test]
async fn test_cleanup_without_sids_runs_full_shutdown() {
    let platform = MockPlatform::new();
    platform.with_cleanup(CleanupBehavior::Succeed);
    let harness = started_with_sessions(platform.clone(), &["s1", "s2"]).await;
    let mut state = harness.listener.state_watch();

    harness
        .push_subsystem(json!({"verb": "cleanup", "object": {}}))
        .await;

    tokio::time::timeout(WAIT, state.wait_for(|s| *s == ListenerState::Stopped))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(platform.cleanup_calls(), 2);
    assert!(harness.listener.registry().is_empty());
}
