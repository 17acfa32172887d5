//! Listener startup, key gate and subsystem pass-through

mod test_helpers;

use platform_listener::error::ListenerError;
use platform_listener::listener::{Listener, ListenerState};
use platform_listener::platform::PlatformCatalog;
use platform_listener::protocol::SubsystemMessage;
use platform_listener::queue::MemoryQueue;
use platform_listener::session::LocalSessionStore;
use platform_listener::testing::mocks::{MockPlatform, VerbBehavior};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_jobs_wait_for_enc_key_broadcast() {
    let platform = MockPlatform::new();
    platform.on_verb("send", VerbBehavior::Succeed(json!({"id": 1})));
    let harness = Harness::new(platform.clone(), None);
    harness.listener.start().unwrap();

    // Key request goes out to the dispatcher
    let dispatcher_channel = harness.listener.channels().dispatcher.clone();
    let payload = harness
        .queue
        .pop_timeout(&dispatcher_channel, WAIT)
        .await
        .unwrap();
    let ping = SubsystemMessage::parse(&payload).unwrap();
    assert!(ping.requests_enc_key());
    assert_eq!(ping.platform.as_deref(), Some(PLATFORM));

    harness
        .push_job(json!({"sessionId": "s1", "verb": "send", "object": {}}))
        .await;
    assert!(harness
        .next_report("s1", Duration::from_millis(100))
        .await
        .is_none());
    assert!(!harness.listener.enc_key_set());
    assert_eq!(harness.listener.state(), ListenerState::AwaitingKey);
    assert!(platform.invocations().is_empty());

    harness
        .push_subsystem(json!({"verb": "enc-key", "object": {"encKey": "secret"}}))
        .await;

    let report = harness.next_report("s1", WAIT).await.unwrap();
    assert!(report.status);
    assert!(harness.listener.enc_key_set());
    assert_eq!(harness.sessions.enc_key().as_deref(), Some("secret"));
    assert_eq!(harness.listener.state(), ListenerState::Consuming);
}

#[tokio::test]
async fn test_key_known_at_startup_skips_request() {
    let platform = MockPlatform::new();
    let harness = Harness::new(platform, Some("key"));
    let mut state = harness.listener.state_watch();
    harness.listener.start().unwrap();

    tokio::time::timeout(WAIT, state.wait_for(|s| *s == ListenerState::Consuming))
        .await
        .unwrap()
        .unwrap();
    let dispatcher_channel = harness.listener.channels().dispatcher.clone();
    assert!(harness.queue.try_pop(&dispatcher_channel).is_none());
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let harness = Harness::new(MockPlatform::new(), Some("key"));
    harness.listener.start().unwrap();
    assert!(matches!(
        harness.listener.start(),
        Err(ListenerError::AlreadyStarted)
    ));
}

#[tokio::test]
async fn test_missing_platform_module_aborts_construction() {
    let config = test_config();
    let queue = Arc::new(MemoryQueue::new());
    let sessions = Arc::new(LocalSessionStore::new(config.channels(), queue.clone()));

    let result = Listener::new(config, &PlatformCatalog::new(), queue, sessions);
    assert!(matches!(
        result,
        Err(ListenerError::PlatformUnavailable { ref locator, .. }) if locator == "mock"
    ));
}

#[tokio::test]
async fn test_probe_construction_failure_aborts_construction() {
    let platform = MockPlatform::new();
    platform.fail_construction();
    let config = test_config();
    let queue = Arc::new(MemoryQueue::new());
    let sessions = Arc::new(LocalSessionStore::new(config.channels(), queue.clone()));

    let result = Listener::new(config, &mock_catalog(&platform), queue, sessions);
    assert!(matches!(
        result,
        Err(ListenerError::PlatformUnavailable { .. })
    ));
}

#[tokio::test]
async fn test_closed_queue_stops_listener() {
    let harness = Harness::new(MockPlatform::new(), Some("key"));
    let mut state = harness.listener.state_watch();
    harness.listener.start().unwrap();

    tokio::time::timeout(WAIT, state.wait_for(|s| *s == ListenerState::Consuming))
        .await
        .unwrap()
        .unwrap();
    platform_listener::queue::JobQueue::close(harness.queue.as_ref()).await;

    tokio::time::timeout(WAIT, state.wait_for(|s| *s == ListenerState::Stopped))
        .await
        .unwrap()
        .unwrap();
}
