//! Protocol client core.
//!
//! - [`AnalysisClient`] is the facade callers use
//! - [`pending`] correlates requests with responses
//! - `dispatcher` routes every inbound message
//! - [`listeners`] fans events out to registered observers
//! - [`reverse`] answers requests the server sends to the client
//! - [`state`] tracks lifecycle, connection and liveness

mod analysis_client;
mod dispatcher;
pub mod listeners;
mod liveness;
pub mod pending;
pub mod reverse;
pub mod state;

pub use analysis_client::{AnalysisClient, ClientBuilder};
pub use listeners::{
    AnalysisListener, ListenerFailure, ListenerFamily, ListenerRegistry, RequestListener,
    ResponseListener, StatusListener, Subscription,
};
pub use pending::{CallHandle, CallState, PendingCallInfo, PendingCallTable};
pub use reverse::{
    NegotiatedHandlers, ReplyFuture, ReverseCallRegistry, ReverseHandler, ShowMessageRequest,
};
pub use state::{ClientState, ConnectionState, Health, StatusEvent};
