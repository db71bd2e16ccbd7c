//! Analysis Client Library
//!
//! Async client for a long-running code-analysis server speaking a JSON
//! request/response/notification protocol over stdio or a Unix socket.
//!
//! - `client` - the protocol client core (calls, dispatch, listeners)
//! - `protocol` - message shapes, codec and the typed method table
//! - `transport` - framing and the byte-stream connection
//! - `config` - client settings, overridable from the environment
//! - `error` - the error taxonomy
//!
//! # Example
//!
//! ```ignore
//! use analysis_client::{AnalysisClient, ClientConfig, Endpoint, ServerCommand};
//! use analysis_client::protocol::methods::{FileParams, GetErrors};
//!
//! let client = AnalysisClient::new(ClientConfig::from_env());
//! let command = ServerCommand::new("dart").arg("language-server").arg("--protocol=analyzer");
//! client.start(&Endpoint::Process(command)).await?;
//!
//! let result = client.call::<GetErrors>(FileParams::new("/work/lib/main.dart")).await?;
//! println!("{} errors", result.errors.len());
//!
//! client.shutdown().await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{AnalysisClient, ClientState, ConnectionState, Health, StatusEvent, Subscription};
pub use config::ClientConfig;
pub use error::{ClientError, ErrorKind};
pub use protocol::{AnalysisEvent, CorrelationId, ServerInfo};
pub use transport::{default_socket_path, Endpoint, Framing, ServerCommand, Transport};
