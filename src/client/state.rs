//! Client lifecycle, connection state and liveness.
//!
//! ```text
//! NotStarted -> Starting -> Running -> ShuttingDown -> Stopped
//!      \            \           \______________________^
//!       \            \_________________________________^
//!        \_____________________________________________^
//! ```
//!
//! [`Lifecycle`] owns the transport guard and is the single place that
//! tears the connection down. Closing runs exactly once no matter how
//! many paths (transport EOF, shutdown, startup failure, drop) race to it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::listeners::ListenerRegistry;
use super::pending::PendingCallTable;
use crate::error::ClientError;
use crate::protocol::ServerInfo;
use crate::transport::TransportGuard;

/// Lifecycle of the client itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    NotStarted,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl ClientState {
    pub fn can_transition_to(self, next: ClientState) -> bool {
        use ClientState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (NotStarted, Stopped)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, ShuttingDown)
                | (Running, Stopped)
                | (ShuttingDown, Stopped)
        )
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ClientState::NotStarted => "not started",
            ClientState::Starting => "starting",
            ClientState::Running => "running",
            ClientState::ShuttingDown => "shutting down",
            ClientState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// State of the connection to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
    Closed,
}

/// Liveness of the server, tracked alongside the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    Healthy,
    Unresponsive,
}

/// What status listeners are told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Lifecycle(ClientState),
    Connection(ConnectionState),
    Health(Health),
    /// The transport closed while the client was not shutting down.
    TransportLost { reason: String },
    /// An inbound message could not be understood; dispatching continued.
    ProtocolAnomaly { detail: String },
}

/// Why the connection is being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CloseCause {
    /// The transport reported closure (EOF, read or write failure).
    Transport(String),
    Shutdown,
    StartupFailed(String),
    Dropped,
}

impl CloseCause {
    fn reason(&self) -> String {
        match self {
            CloseCause::Transport(reason) => reason.clone(),
            CloseCause::Shutdown => "Client shut down".to_string(),
            CloseCause::StartupFailed(reason) => format!("Startup failed: {}", reason),
            CloseCause::Dropped => "Client dropped".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Handshake {
    Pending,
    Connected(ServerInfo),
    Failed(String),
}

struct Status {
    connection: ConnectionState,
    health: Health,
}

pub(crate) struct Lifecycle {
    state: watch::Sender<ClientState>,
    handshake: watch::Sender<Handshake>,
    status: Mutex<Status>,
    closed: AtomicBool,
    guard: Mutex<Option<TransportGuard>>,
    listeners: Arc<ListenerRegistry>,
    pending: Arc<PendingCallTable>,
}

impl Lifecycle {
    pub fn new(listeners: Arc<ListenerRegistry>, pending: Arc<PendingCallTable>) -> Self {
        Self {
            state: watch::channel(ClientState::NotStarted).0,
            handshake: watch::channel(Handshake::Pending).0,
            status: Mutex::new(Status {
                connection: ConnectionState::Disconnected,
                health: Health::Healthy,
            }),
            closed: AtomicBool::new(false),
            guard: Mutex::new(None),
            listeners,
            pending,
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_guard(&self) -> MutexGuard<'_, Option<TransportGuard>> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn connection(&self) -> ConnectionState {
        self.lock_status().connection
    }

    pub fn health(&self) -> Health {
        self.lock_status().health
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        match &*self.handshake.borrow() {
            Handshake::Connected(info) => Some(info.clone()),
            _ => None,
        }
    }

    /// Move to `next` if the lifecycle allows it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidState`] naming `operation` otherwise.
    pub fn transition(&self, next: ClientState, operation: &str) -> Result<(), ClientError> {
        let mut rejected = None;
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                rejected = Some(*current);
                false
            }
        });

        if let Some(state) = rejected {
            return Err(ClientError::InvalidState {
                operation: operation.to_string(),
                state,
            });
        }
        if changed {
            info!("Client {}", next);
            self.listeners.notify_status(&StatusEvent::Lifecycle(next));
        }
        Ok(())
    }

    pub fn set_connection(&self, next: ConnectionState) {
        let changed = {
            let mut status = self.lock_status();
            let changed = status.connection != next;
            status.connection = next;
            changed
        };
        if changed {
            debug!("Connection {:?}", next);
            self.listeners.notify_status(&StatusEvent::Connection(next));
        }
    }

    pub fn set_health(&self, next: Health) {
        let changed = {
            let mut status = self.lock_status();
            let changed = status.health != next;
            status.health = next;
            changed
        };
        if changed {
            match next {
                Health::Healthy => info!("Server is responsive again"),
                Health::Unresponsive => warn!("Server is unresponsive"),
            }
            self.listeners.notify_status(&StatusEvent::Health(next));
        }
    }

    /// Any inbound traffic proves the server is alive.
    pub fn note_traffic(&self) {
        if !self.is_closed() && self.health() == Health::Unresponsive {
            self.set_health(Health::Healthy);
        }
    }

    /// Record the `server.connected` handshake.
    pub fn mark_connected(&self, info: ServerInfo) {
        let accepted = self.handshake.send_if_modified(|handshake| {
            if matches!(handshake, Handshake::Pending) {
                *handshake = Handshake::Connected(info.clone());
                true
            } else {
                false
            }
        });

        if accepted {
            self.set_connection(ConnectionState::Connected);
        } else {
            warn!(
                "Ignoring repeated server.connected (version {}, pid {})",
                info.version, info.pid
            );
        }
    }

    /// Wait until the handshake completes or fails.
    pub async fn wait_for_handshake(&self, limit: Duration) -> Result<ServerInfo, ClientError> {
        let mut rx = self.handshake.subscribe();
        let outcome = match tokio::time::timeout(
            limit,
            rx.wait_for(|h| !matches!(h, Handshake::Pending)),
        )
        .await
        {
            Ok(Ok(handshake)) => (*handshake).clone(),
            Ok(Err(_)) => Handshake::Failed("Handshake abandoned".to_string()),
            Err(_) => Handshake::Failed(format!(
                "Server did not send server.connected within {:?}",
                limit
            )),
        };

        match outcome {
            Handshake::Connected(info) => Ok(info),
            Handshake::Failed(reason) => Err(ClientError::Startup(reason)),
            Handshake::Pending => Err(ClientError::Startup("Handshake pending".to_string())),
        }
    }

    /// Take ownership of the transport's background tasks.
    ///
    /// # Errors
    ///
    /// Fails (and closes the guard) if the lifecycle has already closed.
    pub fn attach_transport(&self, mut guard: TransportGuard) -> Result<(), ClientError> {
        let mut slot = self.lock_guard();
        if self.is_closed() {
            guard.close();
            return Err(ClientError::transport("Client closed before transport attached"));
        }
        *slot = Some(guard);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether a transport is attached and has not been closed.
    pub fn is_open(&self) -> bool {
        !self.is_closed() && self.lock_guard().is_some()
    }

    /// Tear down the connection. Only the first call has any effect;
    /// returns whether this call did the work.
    ///
    /// Stops the transport, fails every pending call (and every later
    /// one) with a transport error, fails a pending handshake, and
    /// leaves the client `Stopped`.
    pub fn close(&self, cause: CloseCause) -> bool {
        // Hold the guard slot while flipping the flag so attach cannot race
        let guard = {
            let mut slot = self.lock_guard();
            if self.closed.swap(true, Ordering::SeqCst) {
                return false;
            }
            slot.take()
        };
        if let Some(mut guard) = guard {
            guard.close();
        }

        let reason = cause.reason();
        let expected = !matches!(cause, CloseCause::Transport(_))
            || self.state() == ClientState::ShuttingDown;

        let drained = self.pending.seal(ClientError::transport(reason.clone()));
        if drained > 0 {
            info!("Failed {} pending request(s): {}", drained, reason);
        }

        self.handshake.send_if_modified(|handshake| {
            if matches!(handshake, Handshake::Pending) {
                *handshake = Handshake::Failed(reason.clone());
                true
            } else {
                false
            }
        });

        self.set_connection(ConnectionState::Closed);

        if expected {
            info!("Connection closed: {}", reason);
        } else {
            warn!("Transport lost: {}", reason);
            self.listeners.notify_status(&StatusEvent::TransportLost {
                reason: reason.clone(),
            });
            self.set_health(Health::Unresponsive);
        }

        let previous = self.state.send_replace(ClientState::Stopped);
        if previous != ClientState::Stopped {
            info!("Client {}", ClientState::Stopped);
            self.listeners
                .notify_status(&StatusEvent::Lifecycle(ClientState::Stopped));
        }

        true
    }
}
