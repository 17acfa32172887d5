//! Instance registry under concurrency
//!
//! Concurrent first jobs for a session must share one handler instance,
//! and no verb may run before that instance finished `init`.

mod test_helpers;

use futures::future::join_all;
use platform_listener::listener::{DispatchOutcome, FatalSignal, InstanceRegistry, JobDispatcher};
use platform_listener::protocol::Job;
use platform_listener::testing::mocks::{MockPlatform, MockSessionStore, VerbBehavior};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

fn dispatcher(platform: &Arc<MockPlatform>) -> (Arc<MockSessionStore>, Arc<JobDispatcher>) {
    let sessions = Arc::new(MockSessionStore::new());
    let registry = Arc::new(InstanceRegistry::new(
        PLATFORM,
        platform.factory(),
        sessions.clone(),
    ));
    let (fatal, _rx) = FatalSignal::channel();
    let dispatcher = Arc::new(JobDispatcher::new(
        PLATFORM,
        registry,
        sessions.clone(),
        fatal,
    ));
    (sessions, dispatcher)
}

#[tokio::test]
async fn test_back_to_back_first_jobs_share_one_instance() {
    let platform = MockPlatform::new();
    platform.on_verb("send", VerbBehavior::Succeed(json!({"ok": true})));
    let release = platform.hold_init();
    let (sessions, dispatcher) = dispatcher(&platform);

    let first = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.dispatch(Job::new("s2", "send", json!({}))).await }
    });
    let second = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.dispatch(Job::new("s2", "send", json!({}))).await }
    });

    // Two dispatch lookups plus the one made for init
    assert!(eventually(Duration::from_secs(1), || sessions.lookups() == 3).await);
    assert!(eventually(Duration::from_secs(1), || platform.init_calls() == 1).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(platform.invocations().is_empty());
    assert!(dispatcher.registry().contains("s2"));

    release.send(true).unwrap();
    assert_eq!(first.await.unwrap().unwrap(), DispatchOutcome::Succeeded);
    assert_eq!(second.await.unwrap().unwrap(), DispatchOutcome::Succeeded);

    assert_eq!(platform.instances_created(), 1);
    assert_eq!(platform.init_calls(), 1);
    assert_eq!(platform.invocations().len(), 2);
    assert_eq!(sessions.responder().reports().len(), 2);
}

#[tokio::test]
async fn test_many_concurrent_sessions_get_one_instance_each() {
    let platform = MockPlatform::new();
    platform.on_verb("send", VerbBehavior::Succeed(json!({})));
    let (sessions, dispatcher) = dispatcher(&platform);

    let jobs = (0..40).map(|i| {
        let dispatcher = dispatcher.clone();
        let sid = format!("s{}", i % 8);
        async move { dispatcher.dispatch(Job::new(sid, "send", json!({}))).await }
    });
    let outcomes = join_all(jobs).await;

    assert!(outcomes
        .iter()
        .all(|o| matches!(o, Ok(DispatchOutcome::Succeeded))));
    assert_eq!(platform.instances_created(), 8);
    assert_eq!(dispatcher.registry().len(), 8);
    assert_eq!(sessions.responder().reports().len(), 40);
}

#[tokio::test]
async fn test_waiters_share_a_failed_init_then_retry_constructs_anew() {
    let platform = MockPlatform::new();
    platform.on_verb("send", VerbBehavior::Succeed(json!({})));
    platform.fail_next_init("expired token");
    let release = platform.hold_init();
    let (sessions, dispatcher) = dispatcher(&platform);

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(Job::new("s1", "send", json!({}))).await })
        })
        .collect();

    assert!(eventually(Duration::from_secs(1), || sessions.lookups() == 4).await);
    assert!(eventually(Duration::from_secs(1), || platform.init_calls() == 1).await);
    release.send(true).unwrap();
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap().unwrap(), DispatchOutcome::InitFailed);
    }
    assert_eq!(platform.instances_created(), 1);
    assert!(dispatcher.registry().is_empty());
    assert!(sessions
        .responder()
        .reports()
        .iter()
        .all(|r| !r.success && r.error.as_deref().unwrap_or("").contains("expired token")));

    let outcome = dispatcher
        .dispatch(Job::new("s1", "send", json!({})))
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Succeeded);
    assert_eq!(platform.instances_created(), 2);
}
