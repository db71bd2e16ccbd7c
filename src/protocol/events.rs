//! Server notifications decoded into typed analysis events.

use serde::Deserialize;
use serde_json::Value;

use super::types::{AnalysisError, AnalysisStatus, PubStatus};

/// Identity of the server reported by `server.connected`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub pid: u32,
}

/// An event notification from the analysis server.
///
/// The handful of events this client acts on are decoded into typed
/// variants; every other event (or a known event whose params do not
/// match) is carried as [`AnalysisEvent::Other`].
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisEvent {
    /// `server.connected`: the server is up and ready for requests.
    ServerConnected(ServerInfo),
    /// `server.error`: the server hit an internal error.
    ServerError {
        is_fatal: bool,
        message: String,
        stack_trace: String,
    },
    /// `server.status`
    ServerStatus {
        analysis: Option<AnalysisStatus>,
        pub_status: Option<PubStatus>,
    },
    /// `analysis.errors`: the full set of errors for one file.
    Errors {
        file: String,
        errors: Vec<AnalysisError>,
    },
    /// `analysis.flushResults`: previously reported results for these
    /// files are no longer valid.
    FlushResults { files: Vec<String> },
    /// Any other event.
    Other { event: String, params: Value },
}

/// A known event whose params did not match the expected shape.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedEvent {
    pub event: String,
    pub params: Value,
    pub detail: String,
}

impl MalformedEvent {
    /// Deliver the raw event anyway.
    pub fn into_other(self) -> AnalysisEvent {
        AnalysisEvent::Other {
            event: self.event,
            params: self.params,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerErrorParams {
    is_fatal: bool,
    message: String,
    #[serde(default)]
    stack_trace: String,
}

#[derive(Deserialize)]
struct ServerStatusParams {
    #[serde(default)]
    analysis: Option<AnalysisStatus>,
    #[serde(default, rename = "pub")]
    pub_status: Option<PubStatus>,
}

#[derive(Deserialize)]
struct ErrorsParams {
    file: String,
    errors: Vec<AnalysisError>,
}

#[derive(Deserialize)]
struct FlushResultsParams {
    files: Vec<String>,
}

impl AnalysisEvent {
    /// Decode a notification by event name.
    ///
    /// # Errors
    ///
    /// Returns a [`MalformedEvent`] (which still carries the raw params)
    /// when a known event does not match its expected shape.
    pub fn decode(event: String, params: Value) -> Result<Self, MalformedEvent> {
        let decoded = match event.as_str() {
            "server.connected" => Some(
                serde_json::from_value::<ServerInfo>(params.clone())
                    .map(AnalysisEvent::ServerConnected),
            ),
            "server.error" => Some(
                serde_json::from_value::<ServerErrorParams>(params.clone()).map(|p| {
                    AnalysisEvent::ServerError {
                        is_fatal: p.is_fatal,
                        message: p.message,
                        stack_trace: p.stack_trace,
                    }
                }),
            ),
            "server.status" => Some(
                serde_json::from_value::<ServerStatusParams>(params.clone()).map(|p| {
                    AnalysisEvent::ServerStatus {
                        analysis: p.analysis,
                        pub_status: p.pub_status,
                    }
                }),
            ),
            "analysis.errors" => Some(
                serde_json::from_value::<ErrorsParams>(params.clone()).map(|p| {
                    AnalysisEvent::Errors {
                        file: p.file,
                        errors: p.errors,
                    }
                }),
            ),
            "analysis.flushResults" => Some(
                serde_json::from_value::<FlushResultsParams>(params.clone())
                    .map(|p| AnalysisEvent::FlushResults { files: p.files }),
            ),
            _ => None,
        };

        let Some(decoded) = decoded else {
            return Ok(AnalysisEvent::Other { event, params });
        };

        decoded.map_err(|e| MalformedEvent {
            detail: format!("malformed {} params: {}", event, e),
            event,
            params,
        })
    }

    /// Wire name of the event.
    pub fn name(&self) -> &str {
        match self {
            AnalysisEvent::ServerConnected(_) => "server.connected",
            AnalysisEvent::ServerError { .. } => "server.error",
            AnalysisEvent::ServerStatus { .. } => "server.status",
            AnalysisEvent::Errors { .. } => "analysis.errors",
            AnalysisEvent::FlushResults { .. } => "analysis.flushResults",
            AnalysisEvent::Other { event, .. } => event,
        }
    }
}
