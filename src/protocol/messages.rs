//! Protocol message types for the listener queues
//!
//! This module defines the records exchanged over the platform channels:
//! incoming jobs, outgoing job reports and subsystem control messages.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A unit of dispatch work addressed to one platform, one session, one verb
///
/// Jobs arrive serialized on the platform's incoming channel. Every field is
/// optional on the wire so that a job lacking a session identifier still
/// parses and can be rejected by the dispatcher instead of the consumer.
///
/// # Examples
/// ```
/// use platform_listener::protocol::Job;
/// use serde_json::json;
///
/// let job: Job = serde_json::from_value(json!({
///     "sessionId": "s1",
///     "verb": "send",
///     "object": {"text": "hi"}
/// })).unwrap();
///
/// assert_eq!(job.session_id(), Some("s1"));
/// assert_eq!(job.verb, "send");
/// assert!(job.credentials.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Session the job belongs to (required for dispatch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Verb to invoke on the platform instance
    #[serde(default)]
    pub verb: String,
    /// Platform-specific payload
    #[serde(default = "empty_object")]
    pub object: Value,
    /// Credentials forwarded by the session layer (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Value>,
    /// Platform the job was addressed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl Job {
    /// Build a job with an object payload and no credentials
    pub fn new(session_id: impl Into<String>, verb: impl Into<String>, object: Value) -> Self {
        Self {
            session_id: Some(session_id.into()),
            verb: verb.into(),
            object,
            credentials: None,
            platform: None,
        }
    }

    /// Attach credentials to the job
    pub fn with_credentials(mut self, credentials: Value) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Session identifier, treating an empty string as absent
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|sid| !sid.is_empty())
    }

    /// Look up a string credential such as `token`
    pub fn credential(&self, name: &str) -> Option<&str> {
        self.credentials
            .as_ref()
            .and_then(|credentials| credentials.get(name))
            .and_then(Value::as_str)
    }

    /// Parse a job from a raw queue payload
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Outcome of a job as delivered back to the requesting client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub session_id: String,
    pub verb: String,
    /// `true` when the verb succeeded
    pub status: bool,
    /// Failure description, absent on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Result object (or partial result on failure)
    #[serde(default = "empty_object")]
    pub object: Value,
}

impl JobReport {
    pub fn new(job: &Job, error: Option<String>, success: bool, result: Value) -> Self {
        Self {
            session_id: job.session_id().unwrap_or_default().to_string(),
            verb: job.verb.clone(),
            status: success,
            message: error,
            object: result,
        }
    }
}

/// Control message carried on a platform's subsystem channel
///
/// # Examples
/// ```
/// use platform_listener::protocol::SubsystemMessage;
///
/// let ping = SubsystemMessage::key_request("github");
/// assert_eq!(ping.verb, "ping");
/// assert_eq!(ping.target.as_deref(), Some("dispatcher"));
/// assert!(ping.requests_enc_key());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubsystemMessage {
    pub verb: String,
    #[serde(default = "empty_object")]
    pub object: Value,
    /// Receiver of the message, e.g. `dispatcher`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Platform that sent the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Verbs understood on the subsystem channel
pub mod subsystem_verbs {
    pub const PING: &str = "ping";
    pub const ENC_KEY: &str = "enc-key";
    pub const CLEANUP: &str = "cleanup";
}

impl SubsystemMessage {
    /// Ask the dispatcher to broadcast the encryption key
    pub fn key_request(platform: &str) -> Self {
        Self {
            verb: subsystem_verbs::PING.to_string(),
            object: json!({
                "requestEncKey": true,
                "timestamp": Utc::now().timestamp_millis(),
            }),
            target: Some("dispatcher".to_string()),
            platform: Some(platform.to_string()),
        }
    }

    /// Broadcast carrying the encryption key
    pub fn enc_key(key: &str) -> Self {
        Self {
            verb: subsystem_verbs::ENC_KEY.to_string(),
            object: json!({ "encKey": key }),
            target: None,
            platform: None,
        }
    }

    /// Cleanup request; no session ids means full shutdown
    pub fn cleanup(session_ids: Option<Vec<String>>) -> Self {
        let object = match session_ids {
            Some(sids) => json!({ "sids": sids }),
            None => empty_object(),
        };
        Self {
            verb: subsystem_verbs::CLEANUP.to_string(),
            object,
            target: None,
            platform: None,
        }
    }

    pub fn requests_enc_key(&self) -> bool {
        self.verb == subsystem_verbs::PING
            && self
                .object
                .get("requestEncKey")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    /// Key carried by an `enc-key` broadcast
    pub fn enc_key_value(&self) -> Option<&str> {
        if self.verb != subsystem_verbs::ENC_KEY {
            return None;
        }
        self.object
            .get("encKey")
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
    }

    /// Session ids carried by a `cleanup` message
    pub fn cleanup_sids(&self) -> Option<Vec<String>> {
        self.object.get("sids").and_then(Value::as_array).map(|sids| {
            sids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }

    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// The `{}` default used for payloads and results
pub fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_parses_camel_case_fields() {
        let payload = br#"{"sessionId":"abc","verb":"create","object":{"type":"project"},"credentials":{"token":"t"}}"#;
        let job = Job::parse(payload).unwrap();

        assert_eq!(job.session_id(), Some("abc"));
        assert_eq!(job.verb, "create");
        assert_eq!(job.object["type"], "project");
        assert_eq!(job.credential("token"), Some("t"));
    }

    #[test]
    fn test_job_without_session_id_still_parses() {
        let job = Job::parse(br#"{"verb":"send"}"#).unwrap();
        assert_eq!(job.session_id(), None);
        assert_eq!(job.object, empty_object());
    }

    #[test]
    fn test_empty_session_id_is_treated_as_missing() {
        let job = Job::parse(br#"{"sessionId":"","verb":"send"}"#).unwrap();
        assert_eq!(job.session_id(), None);
    }

    #[test]
    fn test_job_parse_rejects_invalid_json() {
        assert!(Job::parse(b"{not json").is_err());
        assert!(Job::parse(b"[1,2,3]").is_err());
    }

    #[test]
    fn test_credential_lookup_ignores_non_strings() {
        let job = Job::new("s1", "retrieve", empty_object())
            .with_credentials(json!({"token": 42, "user": "me"}));
        assert_eq!(job.credential("token"), None);
        assert_eq!(job.credential("user"), Some("me"));
        assert_eq!(job.credential("missing"), None);
    }

    #[test]
    fn test_job_report_serialization_omits_message_on_success() {
        let job = Job::new("s1", "send", json!({"text": "hi"}));
        let report = JobReport::new(&job, None, true, json!({"id": 42}));
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["status"], true);
        assert_eq!(value["object"]["id"], 42);
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_subsystem_enc_key_roundtrip() {
        let message = SubsystemMessage::enc_key("secret-key");
        let bytes = serde_json::to_vec(&message).unwrap();
        let parsed = SubsystemMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.enc_key_value(), Some("secret-key"));
        assert!(!parsed.requests_enc_key());
    }

    #[test]
    fn test_enc_key_value_ignores_other_verbs_and_empty_keys() {
        let mut message = SubsystemMessage::enc_key("");
        assert_eq!(message.enc_key_value(), None);

        message.verb = "ping".to_string();
        message.object = json!({"encKey": "k"});
        assert_eq!(message.enc_key_value(), None);
    }

    #[test]
    fn test_cleanup_message_sids() {
        let targeted = SubsystemMessage::cleanup(Some(vec!["a".into(), "b".into()]));
        assert_eq!(targeted.cleanup_sids(), Some(vec!["a".to_string(), "b".to_string()]));

        let full = SubsystemMessage::cleanup(None);
        assert_eq!(full.cleanup_sids(), None);
    }
}
