//! Pool protocol message types and JSON-RPC serialization.
//!
//! Both login styles share the same envelope: newline-delimited JSON-RPC
//! with numeric request ids. They differ in method names and in how errors
//! are reported (`[code, "message", data]` arrays for classic Stratum,
//! `{"code", "message"}` objects for direct-login pools).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobResult;

/// Commands sent from a session to its client task.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    /// Submit a result. `id` is echoed in the verdict event.
    Submit { id: u64, result: JobResult },

    /// Send a keepalive so the pool doesn't drop an idle connection
    KeepAlive,
}

/// JSON-RPC message envelope.
///
/// Messages can be:
/// - Requests (have method and params, may have id)
/// - Responses (have id and result or error)
/// - Notifications (have method and params, no id)
///
/// Classic Stratum sends `id: null` on notifications while direct-login
/// pools omit the id and add a `jsonrpc` field. A missing id deserializes
/// to `None` and unknown fields are ignored, so one type covers both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification from client or server
    Request {
        /// Message ID (null for notifications)
        id: Option<u64>,
        /// Method name (e.g., "login", "job", "mining.notify")
        method: String,
        /// Method parameters
        params: Value,
    },

    /// Response to a request
    Response {
        /// Message ID matching the request
        id: u64,
        /// Result value (present on success)
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error value (present on failure)
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    /// Create a new request message.
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Create a notification (request without ID).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Get the message ID if present.
    pub fn id(&self) -> Option<u64> {
        match self {
            JsonRpcMessage::Request { id, .. } => *id,
            JsonRpcMessage::Response { id, .. } => Some(*id),
        }
    }

    /// Check if this is a notification (request without ID).
    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Request { id: None, .. })
    }

    /// Get the method name for requests.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }

    /// Get the params of a request.
    pub fn params(&self) -> Option<&Value> {
        match self {
            JsonRpcMessage::Request { params, .. } => Some(params),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

/// Human-readable reason from an error value in either protocol style.
pub fn error_reason(error: &Value) -> String {
    let reason = match error {
        Value::Array(arr) => arr.get(1).and_then(Value::as_str),
        Value::Object(obj) => obj.get("message").and_then(Value::as_str),
        Value::String(s) => Some(s.as_str()),
        _ => None,
    };

    reason
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}", error))
}
