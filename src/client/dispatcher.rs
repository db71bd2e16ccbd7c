//! Routing of inbound traffic.
//!
//! The dispatcher is the single consumer of the transport's inbound
//! stream and handles messages strictly one at a time, in arrival order:
//!
//! - responses complete the matching pending call
//! - server requests go to a negotiated reverse-call handler, or are
//!   answered with `UNKNOWN_REQUEST`
//! - notifications fan out to analysis listeners
//! - anything undecodable is reported to status listeners and skipped
//!
//! Reverse-call handlers run on their own tasks so a handler that calls
//! back into the server cannot stall dispatching.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use super::listeners::ListenerRegistry;
use super::pending::PendingCallTable;
use super::reverse::NegotiatedHandlers;
use super::state::{CloseCause, Lifecycle, StatusEvent};
use crate::error::ClientError;
use crate::protocol::{
    AnalysisEvent, Codec, CorrelationId, InboundMessage, OutboundRequest, OutboundResponse,
    RequestError,
};
use crate::transport::{MessageSender, TransportEvent};

/// Encodes and queues outbound messages, reporting each to the request
/// trace listeners.
pub(crate) struct Outbox {
    codec: Arc<dyn Codec>,
    sender: MessageSender,
    listeners: Arc<ListenerRegistry>,
}

impl Outbox {
    pub fn new(codec: Arc<dyn Codec>, sender: MessageSender, listeners: Arc<ListenerRegistry>) -> Self {
        Self {
            codec,
            sender,
            listeners,
        }
    }

    pub fn send_request(&self, request: &OutboundRequest) -> Result<(), ClientError> {
        let text = self.codec.encode_request(request).map_err(|e| {
            ClientError::LocalValidation(format!("cannot encode {}: {}", request.method, e))
        })?;
        self.transmit(text)
    }

    pub fn send_response(&self, response: &OutboundResponse) -> Result<(), ClientError> {
        let text = self.codec.encode_response(response).map_err(|e| {
            ClientError::ProtocolViolation(format!("cannot encode reply {}: {}", response.id, e))
        })?;
        self.transmit(text)
    }

    fn transmit(&self, text: String) -> Result<(), ClientError> {
        self.listeners.notify_request(&text);
        self.sender.send(text)
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }
}

pub(crate) struct Dispatcher {
    pub codec: Arc<dyn Codec>,
    pub outbox: Arc<Outbox>,
    pub pending: Arc<PendingCallTable>,
    pub listeners: Arc<ListenerRegistry>,
    pub reverse: Arc<NegotiatedHandlers>,
    pub lifecycle: Arc<Lifecycle>,
}

impl Dispatcher {
    /// Consume inbound events until the transport closes.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Message(text) => self.dispatch_text(&text),
                TransportEvent::Malformed(detail) => {
                    self.lifecycle.note_traffic();
                    self.anomaly(format!("Unreadable frame: {}", detail));
                }
                TransportEvent::Closed(reason) => {
                    self.lifecycle.close(CloseCause::Transport(reason));
                    break;
                }
            }
        }

        // Inbound stream ended without a Closed event: the guard stopped it
        self.lifecycle
            .close(CloseCause::Transport("Transport stopped".to_string()));
        debug!("Dispatcher stopped");
    }

    fn dispatch_text(&self, text: &str) {
        self.listeners.notify_response(text);
        self.lifecycle.note_traffic();

        match self.codec.decode(text) {
            Ok(message) => self.dispatch(message),
            Err(e) => self.anomaly(format!("Undecodable message: {}", e)),
        }
    }

    pub fn dispatch(&self, message: InboundMessage) {
        trace!("Dispatching {}", message.kind());
        match message {
            InboundMessage::Response { id, outcome } => self.complete(id, outcome),
            InboundMessage::ServerRequest { id, method, params } => {
                self.answer(id, method, params)
            }
            InboundMessage::Notification { event, params } => self.publish(event, params),
        }
    }

    fn complete(&self, id: CorrelationId, outcome: Result<serde_json::Value, RequestError>) {
        let delivered = match outcome {
            Ok(payload) => self.pending.resolve(&id, payload),
            Err(error) => self.pending.reject(&id, error.into()),
        };
        if !delivered {
            // Late (cancelled/timed out), duplicate, or never issued
            debug!("Discarding response for unknown request {}", id);
        }
    }

    fn answer(&self, id: CorrelationId, method: String, params: serde_json::Value) {
        let Some(handler) = self.reverse.get(&method) else {
            warn!("No handler for server request {} ({})", method, id);
            let reply = OutboundResponse::failure(id, RequestError::unknown_request(&method));
            if let Err(e) = self.outbox.send_response(&reply) {
                debug!("Could not reject server request: {}", e);
            }
            return;
        };

        debug!("Handling server request {} ({})", method, id);
        let outbox = Arc::clone(&self.outbox);
        tokio::spawn(async move {
            // A panicking handler still gets an answer to the server
            let reply = match tokio::spawn(handler.handle(params)).await {
                Ok(Ok(result)) => OutboundResponse::success(id, result),
                Ok(Err(error)) => OutboundResponse::failure(id, error),
                Err(join_error) => {
                    error!("Handler for {} failed: {}", method, join_error);
                    OutboundResponse::failure(
                        id,
                        RequestError::server_error(format!("handler for {} failed", method)),
                    )
                }
            };
            if let Err(e) = outbox.send_response(&reply) {
                debug!("Could not reply to server request {}: {}", reply.id, e);
            }
        });
    }

    fn publish(&self, event: String, params: serde_json::Value) {
        let event = match AnalysisEvent::decode(event, params) {
            Ok(event) => event,
            Err(malformed) => {
                self.anomaly(malformed.detail.clone());
                malformed.into_other()
            }
        };

        match &event {
            AnalysisEvent::ServerConnected(info) => self.lifecycle.mark_connected(info.clone()),
            AnalysisEvent::ServerError {
                is_fatal: true,
                message,
                ..
            } => error!("Server reported a fatal error: {}", message),
            AnalysisEvent::ServerError { message, .. } => {
                warn!("Server reported an error: {}", message)
            }
            _ => {}
        }

        self.listeners.notify_analysis(&event);
    }

    fn anomaly(&self, detail: String) {
        warn!("Protocol anomaly: {}", detail);
        self.listeners
            .notify_status(&StatusEvent::ProtocolAnomaly { detail });
    }
}
