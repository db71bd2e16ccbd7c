//! Handlers for requests the server sends to the client.
//!
//! Reverse calls are a negotiated capability: handlers are registered on
//! a [`ReverseCallRegistry`] before the client starts, and their
//! capability names are announced with `server.setClientCapabilities`.
//! A server request for any other method is answered with
//! `UNKNOWN_REQUEST`.
//!
//! ```ignore
//! let mut reverse = ReverseCallRegistry::new();
//! reverse.on_open_url(|url| async move {
//!     println!("server asked to open {}", url);
//!     Ok(())
//! })?;
//! let client = AnalysisClient::builder(config).reverse_calls(reverse).build();
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::error::ClientError;
use crate::protocol::types::{MessageAction, MessageType};
use crate::protocol::RequestError;

/// Server request asking the client to open a URL.
pub const OPEN_URL_REQUEST: &str = "server.openUrlRequest";
/// Server request asking the client to show a message with actions.
pub const SHOW_MESSAGE_REQUEST: &str = "server.showMessageRequest";

/// Capability name announced for [`OPEN_URL_REQUEST`].
pub const OPEN_URL_CAPABILITY: &str = "openUrlRequest";
/// Capability name announced for [`SHOW_MESSAGE_REQUEST`].
pub const SHOW_MESSAGE_CAPABILITY: &str = "showMessageRequest";

/// Future producing the reply to a server request.
pub type ReplyFuture = Pin<Box<dyn Future<Output = Result<Value, RequestError>> + Send>>;

/// Produces the reply to one kind of server request.
pub trait ReverseHandler: Send + Sync {
    fn handle(&self, params: Value) -> ReplyFuture;
}

impl<F, Fut> ReverseHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RequestError>> + Send + 'static,
{
    fn handle(&self, params: Value) -> ReplyFuture {
        Box::pin(self(params))
    }
}

/// Params of `server.showMessageRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShowMessageRequest {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub message: String,
    #[serde(default)]
    pub actions: Vec<MessageAction>,
}

#[derive(Deserialize)]
struct OpenUrlParams {
    url: String,
}

struct Registration {
    capability: String,
    handler: Arc<dyn ReverseHandler>,
}

/// Reverse-call handlers, keyed by server method name.
#[derive(Default)]
pub struct ReverseCallRegistry {
    handlers: BTreeMap<String, Registration>,
}

impl ReverseCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `method`, announced as `capability`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::LocalValidation`] if `method` already has a
    /// handler or either name is empty.
    pub fn register<H>(
        &mut self,
        method: &str,
        capability: &str,
        handler: H,
    ) -> Result<(), ClientError>
    where
        H: ReverseHandler + 'static,
    {
        if method.is_empty() || capability.is_empty() {
            return Err(ClientError::LocalValidation(
                "reverse-call method and capability must not be empty".to_string(),
            ));
        }
        if self.handlers.contains_key(method) {
            return Err(ClientError::LocalValidation(format!(
                "a handler for {} is already registered",
                method
            )));
        }

        self.handlers.insert(
            method.to_string(),
            Registration {
                capability: capability.to_string(),
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    /// Handle `server.openUrlRequest`. Unparsable URLs are answered with
    /// `INVALID_PARAMETER` without calling `handler`.
    pub fn on_open_url<F, Fut>(&mut self, handler: F) -> Result<(), ClientError>
    where
        F: Fn(Url) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RequestError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(OPEN_URL_REQUEST, OPEN_URL_CAPABILITY, move |params: Value| {
            let handler = Arc::clone(&handler);
            async move {
                let params: OpenUrlParams = serde_json::from_value(params).map_err(|e| {
                    RequestError::invalid_parameter(format!("invalid {} params: {}", OPEN_URL_REQUEST, e))
                })?;
                let url = Url::parse(&params.url).map_err(|e| {
                    RequestError::invalid_parameter(format!("invalid url {:?}: {}", params.url, e))
                })?;
                (*handler)(url).await?;
                Ok::<Value, RequestError>(Value::Null)
            }
        })
    }

    /// Handle `server.showMessageRequest`. The handler returns the label
    /// of the action the user chose, if any.
    pub fn on_show_message<F, Fut>(&mut self, handler: F) -> Result<(), ClientError>
    where
        F: Fn(ShowMessageRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, RequestError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(
            SHOW_MESSAGE_REQUEST,
            SHOW_MESSAGE_CAPABILITY,
            move |params: Value| {
                let handler = Arc::clone(&handler);
                async move {
                    let request: ShowMessageRequest =
                        serde_json::from_value(params).map_err(|e| {
                            RequestError::invalid_parameter(format!(
                                "invalid {} params: {}",
                                SHOW_MESSAGE_REQUEST, e
                            ))
                        })?;
                    let offered: Vec<String> =
                        request.actions.iter().map(|a| a.label.clone()).collect();

                    let reply = match (*handler)(request).await? {
                        Some(action) if offered.contains(&action) => json!({ "action": action }),
                        Some(action) => {
                            return Err(RequestError::server_error(format!(
                                "handler chose {:?}, which was not offered",
                                action
                            )))
                        }
                        None => json!({}),
                    };
                    Ok::<Value, RequestError>(reply)
                }
            },
        )
    }

    /// Capability names to announce, in method order.
    pub fn capabilities(&self) -> Vec<String> {
        self.handlers
            .values()
            .map(|r| r.capability.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Freeze the registry into the set the dispatcher consults.
    pub fn negotiate(self) -> NegotiatedHandlers {
        let capabilities = self.capabilities();
        let handlers = self
            .handlers
            .into_iter()
            .map(|(method, registration)| (method, registration.handler))
            .collect();
        NegotiatedHandlers {
            handlers,
            capabilities,
        }
    }
}

/// Immutable set of reverse-call handlers agreed at startup.
#[derive(Default)]
pub struct NegotiatedHandlers {
    handlers: BTreeMap<String, Arc<dyn ReverseHandler>>,
    capabilities: Vec<String>,
}

impl NegotiatedHandlers {
    pub fn get(&self, method: &str) -> Option<Arc<dyn ReverseHandler>> {
        self.handlers.get(method).cloned()
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
