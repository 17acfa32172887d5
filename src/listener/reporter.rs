//! Result reporting
//!
//! Normalizes verb outcomes into the session's `(error, success, result)`
//! response protocol. Reporting never fails.

use crate::error::sanitize_error_message;
use crate::protocol::empty_object;
use crate::session::ResponseHandler;
use serde_json::Value;

/// Report success with `result`, or an empty object when there is none
pub fn report_success(responder: &ResponseHandler, result: Option<Value>) {
    let result = match result {
        None | Some(Value::Null) => empty_object(),
        Some(value) => value,
    };
    responder.respond(None, true, result);
}

/// Report failure with a readable message and any partial result
pub fn report_failure(responder: &ResponseHandler, error: &str, partial: Option<Value>) {
    responder.respond(
        Some(sanitize_error_message(error)),
        false,
        partial.unwrap_or_else(empty_object),
    );
}
