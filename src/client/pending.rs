//! Table of calls awaiting a response.
//!
//! The table is the only state shared between callers issuing requests
//! and the dispatcher matching responses. Every entry reaches exactly one
//! terminal outcome: resolved, rejected, cancelled, timed out, abandoned
//! or drained. Whoever removes the entry from the map under the lock
//! delivers the outcome, so two completions of the same call cannot both
//! win. Dropping a [`CallHandle`], or the future waiting on it, abandons
//! the entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::ClientError;
use crate::protocol::CorrelationId;

type Outcome = Result<Value, ClientError>;
type Decoder<T> = Box<dyn FnOnce(Value) -> Result<T, ClientError> + Send>;

/// How a pending call left the table. Every entry still in the table is
/// waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Completed,
    Cancelled,
    TimedOut,
    /// The caller dropped its handle before a reply arrived.
    Abandoned,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CallState::Completed => "completed",
            CallState::Cancelled => "cancelled",
            CallState::TimedOut => "timed out",
            CallState::Abandoned => "abandoned",
        };
        f.write_str(label)
    }
}

/// Diagnostic view of an outstanding call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCallInfo {
    pub id: CorrelationId,
    pub method: String,
    pub issued_at: DateTime<Utc>,
}

struct PendingCall {
    method: String,
    issued_at: DateTime<Utc>,
    completer: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct TableState {
    next_id: u64,
    calls: HashMap<CorrelationId, PendingCall>,
    /// Set by the final drain; later registrations fail with this error.
    sealed: Option<ClientError>,
}

/// Calls awaiting a response, keyed by correlation id.
#[derive(Default)]
pub struct PendingCallTable {
    state: Mutex<TableState>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh id and a handle that completes with the decoded
    /// result.
    ///
    /// `decode` runs on the awaiting side, so a result that does not fit
    /// the expected shape fails only this call.
    ///
    /// If the table has been sealed the handle is already failed with the
    /// sealing error.
    pub fn register<T, D>(self: &Arc<Self>, method: &str, decode: D) -> CallHandle<T>
    where
        D: FnOnce(Value) -> Result<T, ClientError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = CorrelationId::from(state.next_id);

            match &state.sealed {
                Some(error) => {
                    let _ = tx.send(Err(error.clone()));
                }
                None => {
                    state.calls.insert(
                        id.clone(),
                        PendingCall {
                            method: method.to_string(),
                            issued_at: Utc::now(),
                            completer: tx,
                        },
                    );
                }
            }
            id
        };

        trace!("Registered {} as request {}", method, id);

        CallHandle {
            entry: Entry {
                id,
                table: Arc::downgrade(self),
            },
            method: method.to_string(),
            rx,
            decode: Box::new(decode),
        }
    }

    /// Register a call whose result deserializes into `T`.
    ///
    /// A result that does not deserialize fails the call with
    /// [`ClientError::ProtocolViolation`].
    pub fn register_as<T>(self: &Arc<Self>, method: &str) -> CallHandle<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let name = method.to_string();
        self.register(method, move |value| {
            serde_json::from_value(value).map_err(|e| {
                ClientError::ProtocolViolation(format!("unexpected result for {}: {}", name, e))
            })
        })
    }

    /// Complete the call with a successful payload.
    ///
    /// Returns `false` if no call with this id is waiting.
    pub fn resolve(&self, id: &CorrelationId, payload: Value) -> bool {
        self.finish(id, Ok(payload), CallState::Completed)
    }

    /// Complete the call with an error.
    ///
    /// Returns `false` if no call with this id is waiting.
    pub fn reject(&self, id: &CorrelationId, error: ClientError) -> bool {
        self.finish(id, Err(error), CallState::Completed)
    }

    /// Abandon the call locally. A later response for this id will find
    /// nothing to complete and is discarded.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        let error = ClientError::Cancelled { id: id.clone() };
        self.finish(id, Err(error), CallState::Cancelled)
    }

    /// Fail the call because the caller's deadline elapsed.
    pub fn time_out(&self, id: &CorrelationId, limit: Duration) -> bool {
        self.finish(id, Err(ClientError::Timeout(limit)), CallState::TimedOut)
    }

    /// Forget a call nobody is waiting for any more.
    fn abandon(&self, id: &CorrelationId) -> bool {
        let error = ClientError::Cancelled { id: id.clone() };
        self.finish(id, Err(error), CallState::Abandoned)
    }

    fn finish(&self, id: &CorrelationId, outcome: Outcome, terminal: CallState) -> bool {
        let Some(call) = self.lock().calls.remove(id) else {
            return false;
        };

        debug!(
            "Request {} ({}) {} after {}ms",
            id,
            call.method,
            terminal,
            (Utc::now() - call.issued_at).num_milliseconds()
        );

        // The receiver may already be gone if the caller stopped waiting
        let _ = call.completer.send(outcome);
        true
    }

    /// Fail every waiting call with `error` and empty the table.
    ///
    /// Returns the number of calls failed; zero is a no-op.
    pub fn drain_all(&self, error: &ClientError) -> usize {
        let calls = std::mem::take(&mut self.lock().calls);
        Self::fail_all(calls, error)
    }

    /// Drain the table and refuse all later registrations with `error`.
    /// Only the first seal takes effect.
    pub fn seal(&self, error: ClientError) -> usize {
        let calls = {
            let mut state = self.lock();
            if state.sealed.is_some() {
                return 0;
            }
            state.sealed = Some(error.clone());
            std::mem::take(&mut state.calls)
        };
        Self::fail_all(calls, &error)
    }

    fn fail_all(calls: HashMap<CorrelationId, PendingCall>, error: &ClientError) -> usize {
        let count = calls.len();
        if count > 0 {
            debug!("Failing {} pending request(s): {}", count, error);
        }
        for (_, call) in calls {
            let _ = call.completer.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().calls.is_empty()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.lock().calls.contains_key(id)
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().sealed.is_some()
    }

    /// Outstanding calls, oldest first.
    pub fn snapshot(&self) -> Vec<PendingCallInfo> {
        let mut calls: Vec<PendingCallInfo> = self
            .lock()
            .calls
            .iter()
            .map(|(id, call)| PendingCallInfo {
                id: id.clone(),
                method: call.method.clone(),
                issued_at: call.issued_at,
            })
            .collect();
        calls.sort_by(|a, b| {
            a.issued_at
                .cmp(&b.issued_at)
                .then_with(|| numeric_order(&a.id).cmp(&numeric_order(&b.id)))
        });
        calls
    }
}

fn numeric_order(id: &CorrelationId) -> u64 {
    id.as_str().parse().unwrap_or(u64::MAX)
}

/// A handle's claim on its table entry, released when dropped.
struct Entry {
    id: CorrelationId,
    table: Weak<PendingCallTable>,
}

impl Drop for Entry {
    fn drop(&mut self) {
        // No-op once the call has completed
        if let Some(table) = self.table.upgrade() {
            table.abandon(&self.id);
        }
    }
}

/// Awaitable handle for one call.
///
/// Dropping the handle, or a `wait` future before it resolves, removes
/// the call from the table; a later reply is discarded.
pub struct CallHandle<T> {
    entry: Entry,
    method: String,
    rx: oneshot::Receiver<Outcome>,
    decode: Decoder<T>,
}

impl<T> fmt::Debug for CallHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.entry.id)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl<T> CallHandle<T> {
    pub fn id(&self) -> &CorrelationId {
        &self.entry.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Cancel the call locally. Returns `false` if it had already
    /// completed.
    pub fn cancel(&self) -> bool {
        self.entry
            .table
            .upgrade()
            .map(|table| table.cancel(&self.entry.id))
            .unwrap_or(false)
    }

    /// Wait for the call's terminal outcome.
    pub async fn wait(self) -> Result<T, ClientError> {
        // `_entry` stays alive across the await
        let CallHandle {
            entry: _entry,
            rx,
            decode,
            ..
        } = self;
        settle(rx.await).and_then(decode)
    }

    /// Wait at most `limit`; on expiry the call is failed locally with
    /// [`ClientError::Timeout`]. The server is not told.
    pub async fn wait_timeout(self, limit: Duration) -> Result<T, ClientError> {
        let CallHandle {
            entry,
            mut rx,
            decode,
            ..
        } = self;

        let received = match tokio::time::timeout(limit, &mut rx).await {
            Ok(received) => received,
            Err(_) => {
                if let Some(table) = entry.table.upgrade() {
                    table.time_out(&entry.id, limit);
                }
                // Either our timeout or a racing completion is now queued
                rx.await
            }
        };

        settle(received).and_then(decode)
    }
}

fn settle(received: Result<Outcome, oneshot::error::RecvError>) -> Outcome {
    received.unwrap_or_else(|_| Err(ClientError::transport("Request abandoned by client")))
}
