//! GitHub platform
//!
//! Verbs:
//! - `retrieve`: the authenticated user's issues, grouped by repository
//!   full name and then by issue number
//! - `create`: with `object.type == "project"`, creates a repository named
//!   `object.name`
//!
//! The token comes from `job.credentials.token` on every call.

use super::{PlatformError, PlatformHandler, VerbError};
use crate::config::GithubSection;
use crate::protocol::Job;
use crate::session::PlatformSession;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{json, Map, Value};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

const VERBS: &[&str] = &["retrieve", "create"];

/// Per-session GitHub handler
pub struct GithubPlatform {
    client: Client,
    base_url: String,
    session: Mutex<Option<PlatformSession>>,
}

impl GithubPlatform {
    pub fn new(config: &GithubSection) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("platform-listener/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlatformError::Construction(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            session: Mutex::new(None),
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.session_id.clone()))
    }

    fn request(&self, method: Method, path: &str, token: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Accept", "application/vnd.github+json")
            .bearer_auth(token)
    }

    async fn retrieve(&self, job: &Job) -> Result<Value, VerbError> {
        let token = require_token(job)?;
        let response = self
            .request(Method::GET, "/issues", token)
            .send()
            .await
            .map_err(request_failed)?;

        let status = response.status();
        let body: Value = response.json().await.map_err(request_failed)?;
        if !status.is_success() {
            return Err(VerbError::Failed {
                error: body,
                partial: None,
            });
        }

        let issues = body
            .as_array()
            .ok_or_else(|| VerbError::failed("unexpected response listing issues"))?;
        debug!(session_id = ?self.session_id(), count = issues.len(), "Retrieved issues");
        Ok(group_issues(issues))
    }

    async fn create(&self, job: &Job) -> Result<Value, VerbError> {
        let object_type = job.object.get("type").and_then(Value::as_str);
        if object_type != Some("project") {
            return Err(VerbError::failed(format!(
                "cannot create objects of type {}",
                object_type.unwrap_or("unknown")
            )));
        }

        let token = require_token(job)?;
        let name = job.object.get("name").cloned().unwrap_or(Value::Null);
        let response = self
            .request(Method::POST, "/user/repos", token)
            .json(&json!({ "name": name }))
            .send()
            .await
            .map_err(request_failed)?;

        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        let mut result = match body {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            other => {
                let mut fields = Map::new();
                fields.insert("body".to_string(), other);
                fields
            }
        };
        result.insert("statusCode".to_string(), json!(status));
        debug!(session_id = ?self.session_id(), status, "Created repository");
        Ok(Value::Object(result))
    }
}

#[async_trait]
impl PlatformHandler for GithubPlatform {
    async fn init(&self, session: PlatformSession) -> Result<(), PlatformError> {
        let mut current = self
            .session
            .lock()
            .map_err(|_| PlatformError::InitFailed("session slot poisoned".to_string()))?;
        *current = Some(session);
        Ok(())
    }

    fn supports(&self, verb: &str) -> bool {
        VERBS.contains(&verb)
    }

    async fn invoke(&self, verb: &str, job: &Job) -> Result<Value, VerbError> {
        match verb {
            "retrieve" => self.retrieve(job).await,
            "create" => self.create(job).await,
            other => Err(VerbError::failed(format!(
                "platform github does not implement verb {other}"
            ))),
        }
    }
}

fn require_token(job: &Job) -> Result<&str, VerbError> {
    job.credential("token")
        .ok_or_else(|| VerbError::failed("missing credentials: token"))
}

fn request_failed(error: reqwest::Error) -> VerbError {
    VerbError::failed(format!("GitHub request failed: {error}"))
}

/// `{ "<owner>/<repo>": { "<number>": issue } }`
fn group_issues(issues: &[Value]) -> Value {
    let mut grouped = Map::new();
    for issue in issues {
        let Some(repo) = issue
            .pointer("/repository/full_name")
            .and_then(Value::as_str)
        else {
            continue;
        };
        let number = match issue.get("number") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => continue,
        };

        if let Value::Object(by_number) = grouped
            .entry(repo.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
        {
            by_number.insert(number, issue.clone());
        }
    }
    Value::Object(grouped)
}
