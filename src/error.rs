//! Domain errors and their wire form.
//!
//! Most fallible operations in the crate return [`anyhow::Result`]; the
//! variants of [`WorkbenchError`] are the failures callers actually match
//! on (for example to tell a backend 404 apart from a transport error).
//! [`ErrorPayload`] is what crosses the message channel when a handler
//! fails.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed failures raised by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkbenchError {
    /// A resource path was empty.
    #[error("resource path must not be empty")]
    EmptyPath,

    /// A slug could not be decoded back into a path.
    #[error("invalid slug '{0}'")]
    InvalidSlug(String),

    /// A virtual address string could not be parsed.
    #[error("invalid virtual address '{0}'")]
    InvalidAddress(String),

    /// The backend answered with a non-success status.
    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    /// A message payload was missing a field or had the wrong shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A correlated request expired before its reply arrived.
    #[error("request '{0}' timed out")]
    RequestTimedOut(String),

    /// The outbound side of the message channel is gone.
    #[error("message channel closed")]
    ChannelClosed,
}

impl WorkbenchError {
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Whether this is a backend "not found" answer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Backend { status: 404, .. })
    }
}

/// Serialized error carried by `error` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ErrorPayload {}

/// Turn any error into its wire form.
///
/// The top-level message becomes `message`; the remaining cause chain, if
/// any, is joined into `stack` one cause per line.
pub fn serialize_error(err: &anyhow::Error) -> ErrorPayload {
    let causes: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
    ErrorPayload {
        message: err.to_string(),
        stack: if causes.is_empty() {
            None
        } else {
            Some(causes.join("\n"))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn serialize_plain_error_has_no_stack() {
        let err = anyhow::anyhow!("boom");
        let payload = serialize_error(&err);
        assert_eq!(payload.message, "boom");
        assert!(payload.stack.is_none());
    }

    #[test]
    fn serialize_keeps_cause_chain() {
        let err: anyhow::Error = Err::<(), _>(WorkbenchError::EmptyPath)
            .context("opening resource")
            .unwrap_err();
        let payload = serialize_error(&err);
        assert_eq!(payload.message, "opening resource");
        assert_eq!(payload.stack.as_deref(), Some("resource path must not be empty"));
    }

    #[test]
    fn payload_omits_missing_stack_on_the_wire() {
        let json = serde_json::to_value(ErrorPayload::new("bad")).unwrap();
        assert_eq!(json, serde_json::json!({ "message": "bad" }));
    }
}
