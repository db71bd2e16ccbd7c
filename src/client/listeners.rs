//! Observer registry for the four listener families.
//!
//! Registration returns a [`Subscription`] token used to unregister.
//! Registering the same `Arc` twice in one family returns the existing
//! token, so a listener is never delivered an event twice.
//!
//! Fan-out iterates a snapshot taken when the pass starts: a listener
//! removed during a pass still receives that pass, and a listener added
//! during a pass first hears the next one. A listener that returns an
//! error or panics is reported after the pass; the remaining listeners
//! are still called.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::warn;

use super::state::StatusEvent;
use crate::protocol::AnalysisEvent;

const DIAGNOSTIC_CAPACITY: usize = 64;

/// Receives decoded analysis and server events.
pub trait AnalysisListener: Send + Sync {
    fn on_event(&self, event: &AnalysisEvent) -> anyhow::Result<()>;
}

/// Receives the raw text of every outbound message.
pub trait RequestListener: Send + Sync {
    fn on_request(&self, raw: &str) -> anyhow::Result<()>;
}

/// Receives the raw text of every inbound message.
pub trait ResponseListener: Send + Sync {
    fn on_response(&self, raw: &str) -> anyhow::Result<()>;
}

/// Receives connection, lifecycle and liveness changes.
pub trait StatusListener: Send + Sync {
    fn on_status(&self, status: &StatusEvent) -> anyhow::Result<()>;
}

impl<F> AnalysisListener for F
where
    F: Fn(&AnalysisEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &AnalysisEvent) -> anyhow::Result<()> {
        self(event)
    }
}

impl<F> RequestListener for F
where
    F: Fn(&str) -> anyhow::Result<()> + Send + Sync,
{
    fn on_request(&self, raw: &str) -> anyhow::Result<()> {
        self(raw)
    }
}

impl<F> ResponseListener for F
where
    F: Fn(&str) -> anyhow::Result<()> + Send + Sync,
{
    fn on_response(&self, raw: &str) -> anyhow::Result<()> {
        self(raw)
    }
}

impl<F> StatusListener for F
where
    F: Fn(&StatusEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_status(&self, status: &StatusEvent) -> anyhow::Result<()> {
        self(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerFamily {
    Analysis,
    Request,
    Response,
    Status,
}

impl fmt::Display for ListenerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ListenerFamily::Analysis => "analysis",
            ListenerFamily::Request => "request",
            ListenerFamily::Response => "response",
            ListenerFamily::Status => "status",
        };
        f.write_str(label)
    }
}

/// Token returned by registration; pass it back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    family: ListenerFamily,
    id: u64,
}

impl Subscription {
    pub fn family(&self) -> ListenerFamily {
        self.family
    }
}

/// A listener that failed during fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    pub subscription: Subscription,
    pub message: String,
}

struct ListenerSet<L: ?Sized> {
    entries: Vec<(u64, Arc<L>)>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    /// Insert unless this exact allocation is already present; returns the
    /// id the listener is registered under.
    fn insert(&mut self, id: u64, listener: Arc<L>) -> u64 {
        let existing = self
            .entries
            .iter()
            .find(|(_, present)| same_listener(present, &listener));
        if let Some((existing_id, _)) = existing {
            return *existing_id;
        }
        self.entries.push((id, listener));
        id
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    fn snapshot(&self) -> Vec<(u64, Arc<L>)> {
        self.entries.clone()
    }
}

/// Identity by allocation, ignoring vtable pointers.
fn same_listener<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const u8, Arc::as_ptr(b) as *const u8)
}

#[derive(Default)]
struct Families {
    analysis: ListenerSet<dyn AnalysisListener>,
    request: ListenerSet<dyn RequestListener>,
    response: ListenerSet<dyn ResponseListener>,
    status: ListenerSet<dyn StatusListener>,
}

/// The four listener sets plus the diagnostic channel for failures.
pub struct ListenerRegistry {
    families: Mutex<Families>,
    next_id: AtomicU64,
    diagnostics: broadcast::Sender<ListenerFailure>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);
        Self {
            families: Mutex::new(Families::default()),
            next_id: AtomicU64::new(1),
            diagnostics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Families> {
        self.families.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_analysis_listener(&self, listener: Arc<dyn AnalysisListener>) -> Subscription {
        let id = self.lock().analysis.insert(self.next_id(), listener);
        Subscription {
            family: ListenerFamily::Analysis,
            id,
        }
    }

    pub fn add_request_listener(&self, listener: Arc<dyn RequestListener>) -> Subscription {
        let id = self.lock().request.insert(self.next_id(), listener);
        Subscription {
            family: ListenerFamily::Request,
            id,
        }
    }

    pub fn add_response_listener(&self, listener: Arc<dyn ResponseListener>) -> Subscription {
        let id = self.lock().response.insert(self.next_id(), listener);
        Subscription {
            family: ListenerFamily::Response,
            id,
        }
    }

    pub fn add_status_listener(&self, listener: Arc<dyn StatusListener>) -> Subscription {
        let id = self.lock().status.insert(self.next_id(), listener);
        Subscription {
            family: ListenerFamily::Status,
            id,
        }
    }

    /// Unregister. Returns `false` if the subscription was already removed.
    pub fn remove_listener(&self, subscription: Subscription) -> bool {
        let mut families = self.lock();
        match subscription.family {
            ListenerFamily::Analysis => families.analysis.remove(subscription.id),
            ListenerFamily::Request => families.request.remove(subscription.id),
            ListenerFamily::Response => families.response.remove(subscription.id),
            ListenerFamily::Status => families.status.remove(subscription.id),
        }
    }

    pub fn len(&self, family: ListenerFamily) -> usize {
        let families = self.lock();
        match family {
            ListenerFamily::Analysis => families.analysis.entries.len(),
            ListenerFamily::Request => families.request.entries.len(),
            ListenerFamily::Response => families.response.entries.len(),
            ListenerFamily::Status => families.status.entries.len(),
        }
    }

    /// Receive a copy of every listener failure from now on.
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<ListenerFailure> {
        self.diagnostics.subscribe()
    }

    /// Deliver to analysis listeners; returns the number that failed.
    pub fn notify_analysis(&self, event: &AnalysisEvent) -> usize {
        let snapshot = self.lock().analysis.snapshot();
        self.fan_out(ListenerFamily::Analysis, snapshot, |l| l.on_event(event))
    }

    pub fn notify_request(&self, raw: &str) -> usize {
        let snapshot = self.lock().request.snapshot();
        self.fan_out(ListenerFamily::Request, snapshot, |l| l.on_request(raw))
    }

    pub fn notify_response(&self, raw: &str) -> usize {
        let snapshot = self.lock().response.snapshot();
        self.fan_out(ListenerFamily::Response, snapshot, |l| l.on_response(raw))
    }

    pub fn notify_status(&self, status: &StatusEvent) -> usize {
        let snapshot = self.lock().status.snapshot();
        self.fan_out(ListenerFamily::Status, snapshot, |l| l.on_status(status))
    }

    fn fan_out<L, F>(&self, family: ListenerFamily, snapshot: Vec<(u64, Arc<L>)>, deliver: F) -> usize
    where
        L: ?Sized,
        F: Fn(&L) -> anyhow::Result<()>,
    {
        let mut failures = Vec::new();

        for (id, listener) in snapshot {
            let message = match panic::catch_unwind(AssertUnwindSafe(|| deliver(&*listener))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            failures.push(ListenerFailure {
                subscription: Subscription { family, id },
                message,
            });
        }

        for failure in &failures {
            warn!(
                "{} listener {} failed: {}",
                family, failure.subscription.id, failure.message
            );
            // No subscribers is fine
            let _ = self.diagnostics.send(failure.clone());
        }

        failures.len()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::state::ConnectionState;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::sync::Mutex;

    fn event(name: &str) -> AnalysisEvent {
        AnalysisEvent::Other {
            event: name.to_string(),
            params: Value::Null,
        }
    }

    /// Records what it saw under a label.
    fn recorder(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn AnalysisListener> {
        Arc::new(move |event: &AnalysisEvent| -> anyhow::Result<()> {
            log.lock().unwrap().push(format!("{}:{}", label, event.name()));
            Ok(())
        })
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add_analysis_listener(recorder("a", log.clone()));
        registry.add_analysis_listener(recorder("b", log.clone()));
        registry.add_analysis_listener(recorder("c", log.clone()));

        assert_eq!(registry.notify_analysis(&event("e1")), 0);
        assert_eq!(*log.lock().unwrap(), vec!["a:e1", "b:e1", "c:e1"]);
    }

    #[test]
    fn test_duplicate_registration_delivers_once() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let listener = recorder("a", log.clone());

        let first = registry.add_analysis_listener(listener.clone());
        let second = registry.add_analysis_listener(listener);
        assert_eq!(first, second);
        assert_eq!(registry.len(ListenerFamily::Analysis), 1);

        registry.notify_analysis(&event("e1"));
        assert_eq!(log.lock().unwrap().len(), 1);

        assert!(registry.remove_listener(first));
        assert!(!registry.remove_listener(second));
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut diagnostics = registry.subscribe_diagnostics();

        registry.add_analysis_listener(recorder("a", log.clone()));
        let failing = registry.add_analysis_listener(Arc::new(|_: &AnalysisEvent| -> anyhow::Result<()> {
            Err(anyhow::anyhow!("listener exploded"))
        }));
        registry.add_analysis_listener(Arc::new(|_: &AnalysisEvent| -> anyhow::Result<()> {
            panic!("listener panicked")
        }));
        registry.add_analysis_listener(recorder("d", log.clone()));

        assert_eq!(registry.notify_analysis(&event("e1")), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:e1", "d:e1"]);

        let first = diagnostics.try_recv().expect("missing diagnostic");
        assert_eq!(first.subscription, failing);
        assert_eq!(first.message, "listener exploded");
        let second = diagnostics.try_recv().expect("missing diagnostic");
        assert!(second.message.contains("listener panicked"));
    }

    #[test]
    fn test_removal_during_pass_uses_snapshot() {
        let registry = Arc::new(ListenerRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let remover = {
            let registry = Arc::downgrade(&registry);
            let victim = victim.clone();
            let log = log.clone();
            Arc::new(move |event: &AnalysisEvent| -> anyhow::Result<()> {
                log.lock().unwrap().push(format!("remover:{}", event.name()));
                if let (Some(registry), Some(sub)) = (registry.upgrade(), victim.lock().unwrap().take()) {
                    registry.remove_listener(sub);
                }
                Ok(())
            })
        };
        registry.add_analysis_listener(remover);
        let sub = registry.add_analysis_listener(recorder("later", log.clone()));
        *victim.lock().unwrap() = Some(sub);

        // Removed mid-pass, still receives this pass
        registry.notify_analysis(&event("e1"));
        // Gone for the next one
        registry.notify_analysis(&event("e2"));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["remover:e1", "later:e1", "remover:e2"]
        );
    }

    #[test]
    fn test_families_are_independent() {
        let registry = ListenerRegistry::new();
        let raw = Arc::new(Mutex::new(Vec::new()));
        let statuses = Arc::new(Mutex::new(Vec::new()));

        let raw_log = raw.clone();
        let request = registry.add_request_listener(Arc::new(move |text: &str| -> anyhow::Result<()> {
            raw_log.lock().unwrap().push(format!("out {}", text));
            Ok(())
        }));
        let raw_log = raw.clone();
        registry.add_response_listener(Arc::new(move |text: &str| -> anyhow::Result<()> {
            raw_log.lock().unwrap().push(format!("in {}", text));
            Ok(())
        }));
        let status_log = statuses.clone();
        registry.add_status_listener(Arc::new(move |status: &StatusEvent| -> anyhow::Result<()> {
            status_log.lock().unwrap().push(status.clone());
            Ok(())
        }));

        registry.notify_request("{\"id\":\"1\"}");
        registry.notify_response("{\"id\":\"1\",\"result\":{}}");
        registry.notify_status(&StatusEvent::Connection(ConnectionState::Connected));

        // Removing from one family does not touch another
        assert!(registry.remove_listener(request));
        registry.notify_request("{\"id\":\"2\"}");

        assert_eq!(
            *raw.lock().unwrap(),
            vec!["out {\"id\":\"1\"}", "in {\"id\":\"1\",\"result\":{}}"]
        );
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![StatusEvent::Connection(ConnectionState::Connected)]
        );
    }
}
