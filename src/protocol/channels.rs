//! Queue channel naming and platform name validation
//!
//! Every listener owns two channels scoped to its platform:
//! `listener:<platform>:incoming` for jobs and `listener:<platform>:subsystem`
//! for control messages. When a hub id is configured the names are prefixed
//! with `<hub_id>:` so several gateways can share one broker.
//! Control messages addressed to the dispatcher go to
//! `dispatcher:subsystem` under the same prefix.

use thiserror::Error;

/// Channel names used by one platform listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    prefix: String,
    pub incoming: String,
    pub subsystem: String,
    pub dispatcher: String,
}

impl ChannelNames {
    pub fn new(hub_id: Option<&str>, platform: &str) -> Self {
        let namespace = match hub_id.filter(|id| !id.is_empty()) {
            Some(id) => format!("{id}:"),
            None => String::new(),
        };
        let prefix = format!("{namespace}listener:{platform}");
        Self {
            incoming: format!("{prefix}:incoming"),
            subsystem: format!("{prefix}:subsystem"),
            dispatcher: format!("{namespace}dispatcher:subsystem"),
            prefix,
        }
    }

    /// Channel on which reports for one session are delivered
    pub fn outgoing(&self, session_id: &str) -> String {
        format!("{}:outgoing:{session_id}", self.prefix)
    }
}

/// Validate a platform name: non-empty, `[a-zA-Z0-9._-]+`
pub fn validate_platform_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyPlatformName);
    }

    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidPlatformNameChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for channel components
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Platform name cannot be empty")]
    EmptyPlatformName,
    #[error("Platform name contains invalid character: '{0}'")]
    InvalidPlatformNameChar(char),
}
