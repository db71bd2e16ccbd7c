//! JSON encoding and decoding of protocol messages.
//!
//! The [`Codec`] trait is the boundary between framed text and typed
//! messages. [`JsonCodec`] implements the analysis-server shapes; tests and
//! embedders can supply their own implementation.

use serde_json::{Map, Value};
use thiserror::Error;

use super::message::{CorrelationId, InboundMessage, OutboundRequest, OutboundResponse, RequestError};

/// Failure to turn inbound text into an [`InboundMessage`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message has neither an id nor an event")]
    Unclassifiable,

    #[error("invalid {field} field: {detail}")]
    InvalidField {
        field: &'static str,
        detail: String,
    },
}

/// Failure to serialize an outbound message.
#[derive(Debug, Error)]
#[error("failed to encode message: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Converts between protocol messages and wire text.
pub trait Codec: Send + Sync + 'static {
    /// Encode a client-to-server request.
    fn encode_request(&self, request: &OutboundRequest) -> Result<String, EncodeError>;

    /// Encode a reply to a server-initiated request.
    fn encode_response(&self, response: &OutboundResponse) -> Result<String, EncodeError>;

    /// Decode one inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the text is not JSON or does not match
    /// any of the three inbound shapes.
    fn decode(&self, text: &str) -> Result<InboundMessage, DecodeError>;
}

/// Codec for the analysis server's JSON message shapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_request(&self, request: &OutboundRequest) -> Result<String, EncodeError> {
        Ok(serde_json::to_string(request)?)
    }

    fn encode_response(&self, response: &OutboundResponse) -> Result<String, EncodeError> {
        Ok(serde_json::to_string(response)?)
    }

    fn decode(&self, text: &str) -> Result<InboundMessage, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut object) = value else {
            return Err(DecodeError::NotAnObject);
        };

        // Notifications carry "event" and never an id.
        if let Some(event) = object.remove("event") {
            let event = match event {
                Value::String(name) => name,
                other => {
                    return Err(DecodeError::InvalidField {
                        field: "event",
                        detail: format!("expected string, got {}", other),
                    })
                }
            };
            let params = object.remove("params").unwrap_or(Value::Null);
            return Ok(InboundMessage::Notification { event, params });
        }

        let id = match object.remove("id") {
            Some(id) => parse_id(id)?,
            None => return Err(DecodeError::Unclassifiable),
        };

        if let Some(method) = object.remove("method") {
            let method = match method {
                Value::String(name) => name,
                other => {
                    return Err(DecodeError::InvalidField {
                        field: "method",
                        detail: format!("expected string, got {}", other),
                    })
                }
            };
            let params = object.remove("params").unwrap_or(Value::Null);
            return Ok(InboundMessage::ServerRequest { id, method, params });
        }

        Ok(InboundMessage::Response {
            id,
            outcome: parse_outcome(object)?,
        })
    }
}

/// Ids are strings on the wire, but numeric ids are tolerated.
fn parse_id(id: Value) -> Result<CorrelationId, DecodeError> {
    match id {
        Value::String(text) => Ok(CorrelationId::new(text)),
        Value::Number(number) => Ok(CorrelationId::new(number.to_string())),
        other => Err(DecodeError::InvalidField {
            field: "id",
            detail: format!("expected string or number, got {}", other),
        }),
    }
}

fn parse_outcome(mut object: Map<String, Value>) -> Result<Result<Value, RequestError>, DecodeError> {
    match object.remove("error") {
        Some(Value::Null) | None => Ok(Ok(object.remove("result").unwrap_or(Value::Null))),
        Some(error) => {
            let error: RequestError =
                serde_json::from_value(error).map_err(|e| DecodeError::InvalidField {
                    field: "error",
                    detail: e.to_string(),
                })?;
            Ok(Err(error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_success_response() {
        let message = JsonCodec
            .decode(r#"{"id":"1","result":{"version":"3.4.0"}}"#)
            .unwrap();
        assert_eq!(
            message,
            InboundMessage::Response {
                id: CorrelationId::new("1"),
                outcome: Ok(json!({"version": "3.4.0"})),
            }
        );
    }

    #[test]
    fn test_decode_void_response_has_null_result() {
        let message = JsonCodec.decode(r#"{"id":"2"}"#).unwrap();
        assert_eq!(
            message,
            InboundMessage::Response {
                id: CorrelationId::new("2"),
                outcome: Ok(Value::Null),
            }
        );
    }

    #[test]
    fn test_decode_error_response() {
        let message = JsonCodec
            .decode(r#"{"id":"3","error":{"code":"INVALID_FILE_PATH_FORMAT","message":"bad path","stackTrace":"trace"}}"#)
            .unwrap();
        match message {
            InboundMessage::Response { id, outcome } => {
                assert_eq!(id.as_str(), "3");
                let error = outcome.unwrap_err();
                assert_eq!(error.code, "INVALID_FILE_PATH_FORMAT");
                assert_eq!(error.stack_trace.as_deref(), Some("trace"));
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_numeric_id() {
        let message = JsonCodec.decode(r#"{"id":17,"result":null}"#).unwrap();
        assert!(matches!(
            message,
            InboundMessage::Response { ref id, .. } if id.as_str() == "17"
        ));
    }

    #[test]
    fn test_decode_notification() {
        let message = JsonCodec
            .decode(r#"{"event":"server.connected","params":{"version":"1.0","pid":42}}"#)
            .unwrap();
        assert_eq!(
            message,
            InboundMessage::Notification {
                event: "server.connected".to_string(),
                params: json!({"version": "1.0", "pid": 42}),
            }
        );
    }

    #[test]
    fn test_decode_server_request() {
        let message = JsonCodec
            .decode(r#"{"id":"s7","method":"server.openUrlRequest","params":{"url":"https://dart.dev"}}"#)
            .unwrap();
        match message {
            InboundMessage::ServerRequest { id, method, params } => {
                assert_eq!(id.as_str(), "s7");
                assert_eq!(method, "server.openUrlRequest");
                assert_eq!(params["url"], "https://dart.dev");
            }
            other => panic!("Expected server request, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(matches!(JsonCodec.decode("not json"), Err(DecodeError::Json(_))));
        assert!(matches!(JsonCodec.decode("[1,2]"), Err(DecodeError::NotAnObject)));
        assert!(matches!(
            JsonCodec.decode(r#"{"result":{}}"#),
            Err(DecodeError::Unclassifiable)
        ));
        assert!(matches!(
            JsonCodec.decode(r#"{"id":true}"#),
            Err(DecodeError::InvalidField { field: "id", .. })
        ));
        assert!(matches!(
            JsonCodec.decode(r#"{"id":"1","error":{"code":5}}"#),
            Err(DecodeError::InvalidField { field: "error", .. })
        ));
    }

    #[test]
    fn test_encode_request() {
        let request = OutboundRequest::new(
            CorrelationId::from(9),
            "analysis.setPriorityFiles",
            json!({"files": ["/a.dart"]}),
        );
        let text = JsonCodec.encode_request(&request).unwrap();
        let decoded: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded["method"], "analysis.setPriorityFiles");
        assert_eq!(decoded["params"]["files"][0], "/a.dart");
    }
}
