//! Job dispatch
//!
//! Takes one parsed job through session lookup, instance resolution, verb
//! lookup and invocation, and reports the outcome through the session's
//! response handler. Unexpected errors are reported and then escalated
//! through the fatal channel; structured verb failures are only reported.

use super::fatal::{describe_join_error, FatalError, FatalSignal};
use super::registry::InstanceRegistry;
use super::reporter::{report_failure, report_success};
use crate::observability::metrics::metrics;
use crate::platform::{describe_error, VerbError};
use crate::protocol::Job;
use crate::session::{ResponseHandler, SessionError, SessionStore};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn, Instrument};

/// How a dispatched job ended once it had a response handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Succeeded,
    /// The verb rejected with a structured failure
    Failed,
    /// The instance could not be constructed or initialized
    InitFailed,
    Unsupported,
    /// Reported as failed and raised on the fatal channel
    Escalated,
}

/// Jobs that ended before any report could be sent
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Job for verb {verb} has no session id")]
    MissingSessionId { verb: String },

    #[error("Session lookup failed for {session_id}: {source}")]
    Session {
        session_id: String,
        #[source]
        source: SessionError,
    },
}

/// Routes jobs to per-session platform handlers
pub struct JobDispatcher {
    platform: String,
    registry: Arc<InstanceRegistry>,
    sessions: Arc<dyn SessionStore>,
    fatal: FatalSignal,
}

impl JobDispatcher {
    pub fn new(
        platform: &str,
        registry: Arc<InstanceRegistry>,
        sessions: Arc<dyn SessionStore>,
        fatal: FatalSignal,
    ) -> Self {
        Self {
            platform: platform.to_string(),
            registry,
            sessions,
            fatal,
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Dispatch one job
    ///
    /// Returns once the outcome has been reported. A job without a session
    /// id is rejected before the session store or the registry is touched.
    pub async fn dispatch(&self, job: Job) -> Result<DispatchOutcome, DispatchError> {
        let Some(session_id) = job.session_id().map(str::to_string) else {
            metrics().job_rejected();
            warn!(platform = %self.platform, verb = %job.verb, "Rejecting job without session id");
            return Err(DispatchError::MissingSessionId { verb: job.verb });
        };

        let span = crate::job_span!(
            platform = %self.platform,
            session_id = %session_id,
            verb = %job.verb
        );
        self.dispatch_for_session(session_id, job)
            .instrument(span)
            .await
    }

    async fn dispatch_for_session(
        &self,
        session_id: String,
        job: Job,
    ) -> Result<DispatchOutcome, DispatchError> {
        let session = self
            .sessions
            .get(&session_id, true)
            .await
            .map_err(|source| {
                error!(error = %source, "Session lookup failed, dropping job");
                DispatchError::Session {
                    session_id: session_id.clone(),
                    source,
                }
            })?;
        let responder = session.response_handler(&job);

        metrics().job_started();
        let started = Instant::now();
        let outcome = self.run(&session_id, &job, &responder).await;
        metrics().job_completed(
            &job.verb,
            started.elapsed(),
            outcome == DispatchOutcome::Succeeded,
        );
        debug!(outcome = ?outcome, "Job finished");
        Ok(outcome)
    }

    async fn run(&self, session_id: &str, job: &Job, responder: &ResponseHandler) -> DispatchOutcome {
        let handler = match self.registry.resolve(session_id, true).await {
            Ok(Some(handler)) => handler,
            Ok(None) => {
                report_failure(
                    responder,
                    &format!("no {} instance for session {session_id}", self.platform),
                    None,
                );
                return DispatchOutcome::InitFailed;
            }
            Err(e) => {
                report_failure(responder, &e.to_string(), None);
                if e.is_unexpected() {
                    self.escalate(session_id, "init", e.to_string());
                    return DispatchOutcome::Escalated;
                }
                warn!(error = %e, "Platform instance unavailable");
                return DispatchOutcome::InitFailed;
            }
        };

        if !handler.supports(&job.verb) {
            metrics().verb_unsupported();
            let message = format!(
                "platform {} does not implement verb {}",
                self.platform, job.verb
            );
            warn!("{}", message);
            report_failure(responder, &message, None);
            return DispatchOutcome::Unsupported;
        }

        let task_job = job.clone();
        let invocation =
            tokio::spawn(async move { handler.invoke(&task_job.verb, &task_job).await }).await;

        match invocation {
            Ok(Ok(result)) => {
                info!("Verb succeeded");
                report_success(responder, Some(result));
                DispatchOutcome::Succeeded
            }
            Ok(Err(VerbError::Failed { error, partial })) => {
                let message = describe_error(&error);
                info!(error = %message, "Verb failed");
                report_failure(responder, &message, partial);
                DispatchOutcome::Failed
            }
            Ok(Err(VerbError::Unexpected(message))) => {
                report_failure(responder, &message, None);
                self.escalate(session_id, &job.verb, message);
                DispatchOutcome::Escalated
            }
            Err(join_error) => {
                let message = describe_join_error(join_error);
                report_failure(responder, &message, None);
                self.escalate(session_id, &job.verb, message);
                DispatchOutcome::Escalated
            }
        }
    }

    fn escalate(&self, session_id: &str, stage: &str, message: String) {
        self.fatal.raise(FatalError {
            platform: self.platform.clone(),
            session_id: session_id.to_string(),
            stage: stage.to_string(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockPlatform, MockSessionStore, VerbBehavior};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        platform: Arc<MockPlatform>,
        sessions: Arc<MockSessionStore>,
        dispatcher: JobDispatcher,
        fatal_rx: UnboundedReceiver<FatalError>,
    }

    fn fixture() -> Fixture {
        let platform = MockPlatform::new();
        let sessions = Arc::new(MockSessionStore::new());
        let registry = Arc::new(InstanceRegistry::new(
            "mock",
            platform.factory(),
            sessions.clone(),
        ));
        let (fatal, fatal_rx) = FatalSignal::channel();
        let dispatcher = JobDispatcher::new("mock", registry, sessions.clone(), fatal);
        Fixture {
            platform,
            sessions,
            dispatcher,
            fatal_rx,
        }
    }

    #[tokio::test]
    async fn test_success_reports_result() {
        let mut f = fixture();
        f.platform
            .on_verb("send", VerbBehavior::Succeed(json!({"id": 42})));

        let outcome = f
            .dispatcher
            .dispatch(Job::new("s1", "send", json!({"text": "hi"})))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Succeeded);
        let reports = f.sessions.responder().reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].error, None);
        assert!(reports[0].success);
        assert_eq!(reports[0].result, json!({"id": 42}));
        assert!(f.fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_session_id_touches_nothing() {
        let f = fixture();
        let mut job = Job::new("s1", "send", json!({}));
        job.session_id = None;

        let error = f.dispatcher.dispatch(job).await.unwrap_err();
        assert!(matches!(error, DispatchError::MissingSessionId { .. }));
        assert_eq!(f.sessions.lookups(), 0);
        assert_eq!(f.platform.instances_created(), 0);
        assert!(f.dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_structured_failure_is_not_escalated() {
        let mut f = fixture();
        f.platform.on_verb(
            "send",
            VerbBehavior::Fail {
                error: json!({"message": "rate limited"}),
                partial: Some(json!({"sent": 1})),
            },
        );

        let outcome = f
            .dispatcher
            .dispatch(Job::new("s1", "send", json!({})))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Failed);
        let reports = f.sessions.responder().reports();
        assert_eq!(reports[0].error.as_deref(), Some("rate limited"));
        assert!(!reports[0].success);
        assert_eq!(reports[0].result, json!({"sent": 1}));
        assert!(f.fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsupported_verb_reports_failure() {
        let mut f = fixture();
        f.platform.on_verb("send", VerbBehavior::Succeed(json!({})));

        let outcome = f
            .dispatcher
            .dispatch(Job::new("s1", "join", json!({})))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Unsupported);
        let reports = f.sessions.responder().reports();
        assert_eq!(
            reports[0].error.as_deref(),
            Some("platform mock does not implement verb join")
        );
        assert!(f.fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unexpected_error_reports_then_escalates() {
        let mut f = fixture();
        f.platform
            .on_verb("send", VerbBehavior::Unexpected("socket vanished".into()));

        let outcome = f
            .dispatcher
            .dispatch(Job::new("s1", "send", json!({})))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Escalated);
        assert_eq!(f.sessions.responder().reports().len(), 1);
        let fatal = f.fatal_rx.try_recv().unwrap();
        assert_eq!(fatal.stage, "send");
        assert_eq!(fatal.session_id, "s1");
    }

    #[tokio::test]
    async fn test_panicking_verb_escalates() {
        let mut f = fixture();
        f.platform
            .on_verb("send", VerbBehavior::Panic("handler bug".into()));

        let outcome = f
            .dispatcher
            .dispatch(Job::new("s1", "send", json!({})))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Escalated);
        let reports = f.sessions.responder().reports();
        assert!(reports[0]
            .error
            .as_deref()
            .unwrap()
            .contains("handler bug"));
        assert!(f.fatal_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_init_failure_reports_without_escalation() {
        let mut f = fixture();
        f.platform.on_verb("send", VerbBehavior::Succeed(json!({})));
        f.platform.fail_next_init("bad credentials");

        let outcome = f
            .dispatcher
            .dispatch(Job::new("s1", "send", json!({})))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::InitFailed);
        assert!(f.sessions.responder().reports()[0]
            .error
            .as_deref()
            .unwrap()
            .contains("bad credentials"));
        assert!(f.fatal_rx.try_recv().is_err());
        assert!(f.dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_session_lookup_failure_is_job_error() {
        let mut f = fixture();
        f.sessions.fail_lookups();

        let error = f
            .dispatcher
            .dispatch(Job::new("s1", "send", json!({})))
            .await
            .unwrap_err();

        assert!(matches!(error, DispatchError::Session { .. }));
        assert_eq!(f.platform.instances_created(), 0);
        assert!(f.fatal_rx.try_recv().is_err());
    }
}
