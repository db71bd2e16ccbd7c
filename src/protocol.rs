//! Wire-level vocabulary of the analysis-server protocol.
//!
//! The protocol has three kinds of traffic over one connection:
//!
//! ```text
//! client -> server   {"id":"3","method":"analysis.getErrors","params":{...}}
//! server -> client   {"id":"3","result":{...}}            (response)
//! server -> client   {"event":"analysis.errors","params":{...}}   (notification)
//! server -> client   {"id":"s1","method":"server.openUrlRequest","params":{...}}
//! ```
//!
//! - [`message`] holds the in-memory forms of these messages
//! - [`codec`] converts them to and from JSON text
//! - [`methods`] is the typed method table every call rides on
//! - [`events`] decodes notifications into [`AnalysisEvent`]s
//! - [`types`] holds the payload shapes shared by methods and events

pub mod codec;
pub mod events;
pub mod message;
pub mod methods;
pub mod types;

pub use codec::{Codec, DecodeError, EncodeError, JsonCodec};
pub use events::{AnalysisEvent, MalformedEvent, ServerInfo};
pub use message::{error_codes, CorrelationId, InboundMessage, OutboundRequest, OutboundResponse, RequestError};
pub use methods::{validate_file_path, Ack, Method, NoParams, RequestParams};
