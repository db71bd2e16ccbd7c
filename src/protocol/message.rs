//! In-memory message forms exchanged with the analysis server.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes this client produces or inspects.
pub mod error_codes {
    /// The server does not recognise the requested method.
    pub const UNKNOWN_REQUEST: &str = "UNKNOWN_REQUEST";
    /// A parameter was malformed.
    pub const INVALID_PARAMETER: &str = "INVALID_PARAMETER";
    /// A handler failed for reasons of its own.
    pub const SERVER_ERROR: &str = "SERVER_ERROR";
    /// A file path was not absolute and normalized.
    pub const INVALID_FILE_PATH_FORMAT: &str = "INVALID_FILE_PATH_FORMAT";
}

/// Identifier correlating a request with its response.
///
/// Locally generated ids are decimal renderings of a monotonically
/// increasing counter, so they are never reused within a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap an id received from the wire.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for CorrelationId {
    fn from(counter: u64) -> Self {
        Self(counter.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed failure reported by the server for one request, or by this
/// client in reply to a server-initiated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    /// Error code, e.g. `UNKNOWN_REQUEST`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Optional stack trace.
    #[serde(
        rename = "stackTrace",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stack_trace: Option<String>,
}

impl RequestError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            stack_trace: None,
        }
    }

    /// The reply for a server request this client has no handler for.
    pub fn unknown_request(method: &str) -> Self {
        Self::new(
            error_codes::UNKNOWN_REQUEST,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMETER, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(error_codes::SERVER_ERROR, message)
    }
}

/// A client-to-server request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundRequest {
    pub id: CorrelationId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl OutboundRequest {
    /// Build a request; a `null` params value is omitted from the wire.
    pub fn new(id: CorrelationId, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params: (!params.is_null()).then_some(params),
        }
    }
}

/// This client's reply to a server-initiated request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundResponse {
    pub id: CorrelationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RequestError>,
}

impl OutboundResponse {
    /// A successful reply; a `null` result is omitted from the wire.
    pub fn success(id: CorrelationId, result: Value) -> Self {
        Self {
            id,
            result: (!result.is_null()).then_some(result),
            error: None,
        }
    }

    pub fn failure(id: CorrelationId, error: RequestError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A decoded message read from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Reply to a request this client sent. A missing `result` decodes
    /// as `Value::Null`.
    Response {
        id: CorrelationId,
        outcome: Result<Value, RequestError>,
    },
    /// Request initiated by the server (a reverse call).
    ServerRequest {
        id: CorrelationId,
        method: String,
        params: Value,
    },
    /// Event notification.
    Notification { event: String, params: Value },
}

impl InboundMessage {
    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Response { .. } => "response",
            InboundMessage::ServerRequest { .. } => "server request",
            InboundMessage::Notification { .. } => "notification",
        }
    }
}
