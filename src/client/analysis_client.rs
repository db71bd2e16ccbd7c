//! The public client facade.

use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::dispatcher::{Dispatcher, Outbox};
use super::listeners::{
    AnalysisListener, ListenerFailure, ListenerRegistry, RequestListener, ResponseListener,
    StatusListener, Subscription,
};
use super::liveness::spawn_watchdog;
use super::pending::{CallHandle, PendingCallInfo, PendingCallTable};
use super::reverse::{NegotiatedHandlers, ReverseCallRegistry};
use super::state::{ClientState, CloseCause, ConnectionState, Health, Lifecycle};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::protocol::methods::{
    CancelRequest, CancelRequestParams, SetClientCapabilities, SetClientCapabilitiesParams,
    Shutdown,
};
use crate::protocol::{
    Codec, CorrelationId, JsonCodec, Method, NoParams, OutboundRequest, RequestParams, ServerInfo,
};
use crate::transport::{Endpoint, Transport};

pub(crate) struct Inner {
    config: ClientConfig,
    codec: Arc<dyn Codec>,
    pending: Arc<PendingCallTable>,
    listeners: Arc<ListenerRegistry>,
    reverse: Arc<NegotiatedHandlers>,
    lifecycle: Arc<Lifecycle>,
    outbox: OnceLock<Arc<Outbox>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.lifecycle.close(CloseCause::Dropped);
    }
}

/// Builder for [`AnalysisClient`].
pub struct ClientBuilder {
    config: ClientConfig,
    codec: Arc<dyn Codec>,
    reverse: ReverseCallRegistry,
}

impl ClientBuilder {
    /// Replace the default [`JsonCodec`].
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Reverse-call handlers to negotiate at startup.
    pub fn reverse_calls(mut self, registry: ReverseCallRegistry) -> Self {
        self.reverse = registry;
        self
    }

    pub fn build(self) -> AnalysisClient {
        let listeners = Arc::new(ListenerRegistry::new());
        let pending = Arc::new(PendingCallTable::new());
        let lifecycle = Arc::new(Lifecycle::new(listeners.clone(), pending.clone()));

        AnalysisClient {
            inner: Arc::new(Inner {
                config: self.config,
                codec: self.codec,
                pending,
                listeners,
                reverse: Arc::new(self.reverse.negotiate()),
                lifecycle,
                outbox: OnceLock::new(),
            }),
        }
    }
}

/// Async client for the analysis server.
///
/// Cloning is cheap and every clone drives the same connection. The
/// connection is closed when the last clone is dropped, if `shutdown`
/// was not called first.
///
/// # Example
///
/// ```ignore
/// use analysis_client::{AnalysisClient, ClientConfig, Endpoint, ServerCommand};
/// use analysis_client::protocol::methods::{GetErrors, FileParams};
///
/// let client = AnalysisClient::new(ClientConfig::from_env());
/// let endpoint = Endpoint::Process(ServerCommand::new("dart").arg("language-server").arg("--protocol=analyzer"));
/// let server = client.start(&endpoint).await?;
/// println!("connected to {}", server.version);
///
/// let errors = client.call::<GetErrors>(FileParams::new("/work/lib/main.dart")).await?;
/// client.shutdown().await?;
/// ```
#[derive(Clone)]
pub struct AnalysisClient {
    inner: Arc<Inner>,
}

impl AnalysisClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            codec: Arc::new(JsonCodec),
            reverse: ReverseCallRegistry::new(),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub(crate) fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.inner.lifecycle)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ---- lifecycle -------------------------------------------------------

    /// Connect to `endpoint`, wait for `server.connected` and negotiate
    /// client capabilities.
    ///
    /// On failure the client is left `Stopped` with nothing running.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidState`] if the client was already started
    /// - [`ClientError::Startup`] if the transport cannot be established,
    ///   the handshake does not arrive in time, or capability negotiation
    ///   fails
    pub async fn start(&self, endpoint: &Endpoint) -> Result<ServerInfo, ClientError> {
        self.begin_start()?;
        info!("Starting analysis client ({})", endpoint);

        let transport = match Transport::connect(endpoint, self.inner.config.framing).await {
            Ok(transport) => transport,
            Err(e) => return Err(self.fail_startup(e)),
        };
        self.finish_start(transport).await
    }

    /// Like [`start`](Self::start), over an already-established transport.
    pub async fn start_with_transport(&self, transport: Transport) -> Result<ServerInfo, ClientError> {
        self.begin_start()?;
        self.finish_start(transport).await
    }

    fn begin_start(&self) -> Result<(), ClientError> {
        self.inner.lifecycle.transition(ClientState::Starting, "start")?;
        self.inner.lifecycle.set_connection(ConnectionState::Connecting);
        Ok(())
    }

    async fn finish_start(&self, transport: Transport) -> Result<ServerInfo, ClientError> {
        let inner = &self.inner;
        let (sender, inbound, guard) = transport.into_parts();

        if let Err(e) = inner.lifecycle.attach_transport(guard) {
            return Err(self.fail_startup(e));
        }

        let outbox = Arc::new(Outbox::new(
            Arc::clone(&inner.codec),
            sender,
            Arc::clone(&inner.listeners),
        ));
        if inner.outbox.set(Arc::clone(&outbox)).is_err() {
            return Err(self.fail_startup(ClientError::Startup(
                "Client was already connected".to_string(),
            )));
        }

        let dispatcher = Dispatcher {
            codec: Arc::clone(&inner.codec),
            outbox,
            pending: Arc::clone(&inner.pending),
            listeners: Arc::clone(&inner.listeners),
            reverse: Arc::clone(&inner.reverse),
            lifecycle: Arc::clone(&inner.lifecycle),
        };
        tokio::spawn(dispatcher.run(inbound));

        let server = match inner
            .lifecycle
            .wait_for_handshake(inner.config.startup_timeout)
            .await
        {
            Ok(server) => server,
            Err(e) => return Err(self.fail_startup(e)),
        };
        info!(
            "Connected to analysis server {} (pid {})",
            server.version, server.pid
        );

        if let Err(e) = self.negotiate_capabilities().await {
            return Err(self.fail_startup(e));
        }

        if let Err(e) = inner.lifecycle.transition(ClientState::Running, "finish start") {
            return Err(self.fail_startup(e));
        }

        if let Some(period) = inner.config.ping_interval {
            spawn_watchdog(Arc::downgrade(inner), period, inner.config.ping_timeout);
        }

        Ok(server)
    }

    async fn negotiate_capabilities(&self) -> Result<(), ClientError> {
        let requests = self.inner.reverse.capabilities().to_vec();
        let supports_uris = self.inner.config.supports_uris;
        if requests.is_empty() && !supports_uris {
            return Ok(());
        }

        debug!(
            "Negotiating client capabilities {:?} for {:?}",
            requests,
            self.inner.reverse.methods().collect::<Vec<_>>()
        );
        let params = SetClientCapabilitiesParams {
            requests,
            supports_uris: supports_uris.then_some(true),
            lsp_capabilities: None,
        };

        match self.call::<SetClientCapabilities>(params).await {
            Ok(_) => Ok(()),
            // Older servers do not know the request; reverse calls just won't arrive
            Err(ClientError::Remote { code, message, .. }) => {
                warn!("Server rejected client capabilities ({}): {}", code, message);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn fail_startup(&self, error: ClientError) -> ClientError {
        let error = match error {
            ClientError::Startup(_) => error,
            other => ClientError::Startup(other.to_string()),
        };
        warn!("{}", error);

        let reason = match &error {
            ClientError::Startup(reason) => reason.clone(),
            other => other.to_string(),
        };
        self.inner.lifecycle.close(CloseCause::StartupFailed(reason));
        error
    }

    /// Ask the server to shut down, then close the connection.
    ///
    /// Waits at most the configured shutdown timeout for the server's
    /// reply. The transport is closed and every pending call failed
    /// whether or not the server answered. Calling this on a client that
    /// is already stopped (or stopping) is a no-op.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let lifecycle = &self.inner.lifecycle;

        match lifecycle.state() {
            ClientState::Stopped | ClientState::ShuttingDown => return Ok(()),
            ClientState::NotStarted | ClientState::Starting => {
                lifecycle.close(CloseCause::Shutdown);
                return Ok(());
            }
            ClientState::Running => {}
        }

        if lifecycle
            .transition(ClientState::ShuttingDown, "shut down")
            .is_err()
        {
            // Lost a race with another shutdown or a transport loss
            return Ok(());
        }
        lifecycle.set_connection(ConnectionState::ShuttingDown);
        info!("Shutting down analysis server");

        let limit = self.inner.config.shutdown_timeout;
        match self.issue::<Shutdown>(NoParams, &[ClientState::ShuttingDown]) {
            Ok(handle) => match handle.wait_timeout(limit).await {
                Ok(_) => debug!("Server acknowledged shutdown"),
                Err(e) => debug!("No clean shutdown reply: {}", e),
            },
            Err(e) => debug!("Shutdown request not sent: {}", e),
        }

        lifecycle.close(CloseCause::Shutdown);
        Ok(())
    }

    /// Resolve once the client reaches `Stopped`.
    pub async fn stopped(&self) {
        let mut state = self.inner.lifecycle.subscribe_state();
        // The sender lives as long as the client, so this only ends at Stopped
        let _ = state.wait_for(|s| *s == ClientState::Stopped).await;
    }

    // ---- calls -----------------------------------------------------------

    /// Validate, register and send a request, returning its handle.
    ///
    /// Validation runs first, so invalid params never allocate an id or
    /// reach the transport. Dropping the returned handle abandons the call.
    ///
    /// # Errors
    ///
    /// - [`ClientError::LocalValidation`] if the params are invalid
    /// - [`ClientError::InvalidState`] unless the client is starting or
    ///   running
    /// - [`ClientError::Transport`] if the transport has closed
    pub fn send<M: Method>(&self, params: M::Params) -> Result<CallHandle<M::Result>, ClientError> {
        self.issue::<M>(params, &[ClientState::Starting, ClientState::Running])
    }

    fn issue<M: Method>(
        &self,
        params: M::Params,
        allowed: &[ClientState],
    ) -> Result<CallHandle<M::Result>, ClientError> {
        params.validate()?;

        let state = self.inner.lifecycle.state();
        let not_ready = || ClientError::InvalidState {
            operation: format!("send {}", M::NAME),
            state,
        };
        if !allowed.contains(&state) {
            return Err(not_ready());
        }
        let outbox = self.inner.outbox.get().ok_or_else(not_ready)?;

        let params = serde_json::to_value(&params).map_err(|e| {
            ClientError::LocalValidation(format!("cannot encode {} params: {}", M::NAME, e))
        })?;

        let handle = self.inner.pending.register_as::<M::Result>(M::NAME);
        let request = OutboundRequest::new(handle.id().clone(), M::NAME, params);
        if let Err(e) = outbox.send_request(&request) {
            self.inner.pending.reject(handle.id(), e.clone());
            return Err(e);
        }

        debug!("Sent {} ({})", M::NAME, handle.id());
        Ok(handle)
    }

    /// Send a request and wait for its result, bounded by the configured
    /// request timeout.
    pub async fn call<M: Method>(&self, params: M::Params) -> Result<M::Result, ClientError> {
        let handle = self.send::<M>(params)?;
        match self.inner.config.request_timeout {
            Some(limit) => handle.wait_timeout(limit).await,
            None => handle.wait().await,
        }
    }

    /// Cancel a pending call.
    ///
    /// Local bookkeeping is removed immediately and the caller sees
    /// [`ClientError::Cancelled`]; the server is asked to stop with a
    /// best-effort `server.cancelRequest`. Returns `false` if the call had
    /// already completed.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        if !self.inner.pending.cancel(id) {
            return false;
        }

        if self.state() == ClientState::Running {
            // Fire and forget: dropping the handle releases its entry at once
            if let Err(e) = self.send::<CancelRequest>(CancelRequestParams { id: id.clone() }) {
                debug!("Could not send cancel for {}: {}", id, e);
            }
        }
        true
    }

    // ---- listeners -------------------------------------------------------

    pub fn add_analysis_listener(&self, listener: Arc<dyn AnalysisListener>) -> Subscription {
        self.inner.listeners.add_analysis_listener(listener)
    }

    pub fn add_request_listener(&self, listener: Arc<dyn RequestListener>) -> Subscription {
        self.inner.listeners.add_request_listener(listener)
    }

    pub fn add_response_listener(&self, listener: Arc<dyn ResponseListener>) -> Subscription {
        self.inner.listeners.add_response_listener(listener)
    }

    pub fn add_status_listener(&self, listener: Arc<dyn StatusListener>) -> Subscription {
        self.inner.listeners.add_status_listener(listener)
    }

    pub fn remove_listener(&self, subscription: Subscription) -> bool {
        self.inner.listeners.remove_listener(subscription)
    }

    /// Listener failures, as they happen.
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<ListenerFailure> {
        self.inner.listeners.subscribe_diagnostics()
    }

    // ---- introspection ---------------------------------------------------

    pub fn state(&self) -> ClientState {
        self.inner.lifecycle.state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lifecycle.connection()
    }

    pub fn health(&self) -> Health {
        self.inner.lifecycle.health()
    }

    /// Version and pid from the handshake, once connected.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.lifecycle.server_info()
    }

    /// Whether the transport is up and accepting messages.
    pub fn is_socket_open(&self) -> bool {
        self.inner.lifecycle.is_open()
            && self
                .inner
                .outbox
                .get()
                .map(|outbox| outbox.is_open())
                .unwrap_or(false)
    }

    /// Outstanding calls, oldest first.
    pub fn pending_calls(&self) -> Vec<PendingCallInfo> {
        self.inner.pending.snapshot()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}
