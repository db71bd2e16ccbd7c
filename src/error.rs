//! Error taxonomy for the analysis client.
//!
//! Every operation on [`AnalysisClient`](crate::client::AnalysisClient)
//! resolves to a [`ClientError`] on failure. Per-call errors (remote,
//! validation, cancellation, timeout) only ever reach the caller that
//! issued the call; systemic errors (transport loss) reach every
//! outstanding caller at once.

use std::time::Duration;

use thiserror::Error;

use crate::client::ClientState;
use crate::protocol::{CorrelationId, RequestError};

/// Coarse classification of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection lost, refused, or closed.
    Transport,
    /// The remote side sent a malformed or semantically invalid message.
    ProtocolViolation,
    /// The server reported a typed failure for a specific call.
    Remote,
    /// The caller supplied invalid arguments.
    LocalValidation,
    /// The caller cancelled the call.
    Cancelled,
    /// A local deadline elapsed before the server replied.
    Timeout,
    /// The client could not be started.
    Startup,
    /// The operation is not permitted in the current lifecycle state.
    InvalidState,
}

/// Errors surfaced by the analysis client.
///
/// The type is `Clone` so a single systemic failure can be delivered to
/// every outstanding call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// The transport is gone (closed, refused, or failed mid-write).
    #[error("Transport error: {reason}")]
    Transport {
        /// Why the transport closed.
        reason: String,
    },

    /// The server sent something that does not fit the protocol.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server answered the call with an error.
    #[error("Server error {code}: {message}")]
    Remote {
        /// Protocol error code (e.g. `INVALID_FILE_PATH_FORMAT`).
        code: String,
        /// Human-readable message from the server.
        message: String,
        /// Server-side stack trace, when provided.
        stack_trace: Option<String>,
    },

    /// Arguments were rejected before anything was sent.
    #[error("Invalid argument: {0}")]
    LocalValidation(String),

    /// The call was cancelled by the caller.
    #[error("Request {id} was cancelled")]
    Cancelled {
        /// Id of the cancelled call.
        id: CorrelationId,
    },

    /// No reply arrived within the caller's deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The client failed to reach the running state.
    #[error("Startup failed: {0}")]
    Startup(String),

    /// The operation is not allowed in the current lifecycle state.
    #[error("Cannot {operation} while client is {state}")]
    InvalidState {
        /// What was attempted.
        operation: String,
        /// State the client was in.
        state: ClientState,
    },
}

impl ClientError {
    /// Build a transport error from any displayable reason.
    pub fn transport(reason: impl Into<String>) -> Self {
        ClientError::Transport {
            reason: reason.into(),
        }
    }

    /// Project this error onto the protocol error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Transport { .. } => ErrorKind::Transport,
            ClientError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            ClientError::Remote { .. } => ErrorKind::Remote,
            ClientError::LocalValidation(_) => ErrorKind::LocalValidation,
            ClientError::Cancelled { .. } => ErrorKind::Cancelled,
            ClientError::Timeout(_) => ErrorKind::Timeout,
            ClientError::Startup(_) => ErrorKind::Startup,
            ClientError::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }

    /// Whether this error affects the whole connection rather than one call.
    pub fn is_systemic(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Startup)
    }
}

impl From<RequestError> for ClientError {
    fn from(err: RequestError) -> Self {
        ClientError::Remote {
            code: err.code,
            message: err.message,
            stack_trace: err.stack_trace,
        }
    }
}
