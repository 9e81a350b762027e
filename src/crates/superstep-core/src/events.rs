//! Lifecycle events and the publish/subscribe bus
//!
//! The engine, the state store and the error handler publish typed
//! [`Event`]s on an [`EventBus`]. Observers register handlers per
//! [`EventType`] or for every event.
//!
//! # Delivery
//!
//! | Method | Sync handlers | Async handlers |
//! |--------|---------------|----------------|
//! | [`EventBus::emit`] | called in registration order | skipped |
//! | [`EventBus::emit_async`] | called in registration order | awaited in registration order |
//!
//! # Fault isolation
//!
//! A handler that returns an error or panics never affects the publisher or
//! the other handlers. The failure is logged and then reported to the
//! remaining handlers as a [`EventPayload::HandlerFailed`] event. Failures
//! while delivering `HandlerFailed` are only logged.
//!
//! ```rust
//! use superstep_core::events::{Event, EventBus, EventPayload, EventType};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let bus = EventBus::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//!
//! let counter = seen.clone();
//! bus.on(EventType::SuperstepStarted, move |_event| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//!     Ok(())
//! });
//! bus.on(EventType::SuperstepStarted, |_event| Err("flaky observer".into()));
//!
//! bus.emit(&Event::new(EventPayload::SuperstepStarted {
//!     superstep: 0,
//!     active_nodes: vec!["start".into()],
//! }));
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! ```

use crate::error::BoxError;
use crate::error_handler::ErrorPolicy;
use crate::graph::NodeId;
use crate::state::StateMap;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Discriminant of [`EventPayload`], used as the registration key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    SuperstepStarted,
    SuperstepCompleted,
    NodeCompleted,
    NodeError,
    Recovery,
    StateChanged,
    HandlerFailed,
}

/// Event data, one variant per [`EventType`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// A run began
    WorkflowStarted {
        graph_id: String,
        run_id: String,
        start_node: NodeId,
    },

    /// A run ended with no pending input
    WorkflowCompleted {
        graph_id: String,
        run_id: String,
        total_supersteps: usize,
        duration_ms: u64,
    },

    /// A run ended with a fatal error
    WorkflowFailed {
        graph_id: String,
        run_id: String,
        superstep: usize,
        node_id: Option<NodeId>,
        error: String,
    },

    /// A round is about to dispatch its active nodes
    SuperstepStarted {
        superstep: usize,
        active_nodes: Vec<NodeId>,
    },

    /// Every active node of a round finished and was routed
    SuperstepCompleted {
        superstep: usize,
        nodes_executed: usize,
        messages_sent: usize,
    },

    /// A node produced output (possibly after recovery)
    NodeCompleted {
        node_id: NodeId,
        superstep: usize,
        duration_ms: u64,
        output: StateMap,
    },

    /// A node invocation failed, before the policy was applied
    NodeError {
        node_id: NodeId,
        error: String,
        error_kind: String,
        attempt: u32,
    },

    /// The error policy decided how to treat a failure
    ///
    /// `success` is false when the failure escalated to a fatal error.
    Recovery {
        node_id: NodeId,
        action: ErrorPolicy,
        success: bool,
        attempt: u32,
    },

    /// A state key was written
    StateChanged {
        key: String,
        old_value: Value,
        new_value: Value,
        source: String,
    },

    /// A handler failed while processing another event
    HandlerFailed {
        handler_id: HandlerId,
        event_type: EventType,
        error: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::WorkflowStarted { .. } => EventType::WorkflowStarted,
            Self::WorkflowCompleted { .. } => EventType::WorkflowCompleted,
            Self::WorkflowFailed { .. } => EventType::WorkflowFailed,
            Self::SuperstepStarted { .. } => EventType::SuperstepStarted,
            Self::SuperstepCompleted { .. } => EventType::SuperstepCompleted,
            Self::NodeCompleted { .. } => EventType::NodeCompleted,
            Self::NodeError { .. } => EventType::NodeError,
            Self::Recovery { .. } => EventType::Recovery,
            Self::StateChanged { .. } => EventType::StateChanged,
            Self::HandlerFailed { .. } => EventType::HandlerFailed,
        }
    }
}

/// A timestamped event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

/// Identifies a registration for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

type HandlerResult = std::result::Result<(), BoxError>;
type SyncHandler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

#[derive(Clone)]
struct Registration {
    id: HandlerId,
    filter: Option<EventType>,
    handler: Handler,
}

impl Registration {
    fn matches(&self, event_type: EventType) -> bool {
        self.filter.map_or(true, |filter| filter == event_type)
    }
}

/// Handler failure captured during one delivery pass
struct Failure {
    handler_id: HandlerId,
    error: String,
}

/// Typed publish/subscribe bus with per-handler fault isolation
#[derive(Default)]
pub struct EventBus {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.registrations.read().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous handler for one event type
    pub fn on<F>(&self, event_type: EventType, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(Some(event_type), Handler::Sync(Arc::new(handler)))
    }

    /// Register a synchronous handler for every event
    pub fn on_any<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(None, Handler::Sync(Arc::new(handler)))
    }

    /// Register an async handler for one event type
    ///
    /// Async handlers only run from [`emit_async`](Self::emit_async).
    pub fn on_async<F, Fut>(&self, event_type: EventType, handler: F) -> HandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(Some(event_type), Handler::Async(boxed_async(handler)))
    }

    /// Register an async handler for every event
    pub fn on_any_async<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(None, Handler::Async(boxed_async(handler)))
    }

    /// Stream of events matching `filter` (`None` for all).
    ///
    /// Delivery happens from both `emit` and `emit_async`. Dropping the stream
    /// silences it; the registration itself stays until [`off`](Self::off).
    pub fn subscribe(&self, filter: Option<EventType>) -> (HandlerId, UnboundedReceiverStream<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: SyncHandler = Arc::new(move |event: &Event| {
            // A closed receiver just means nobody is listening anymore.
            let _ = tx.send(event.clone());
            Ok(())
        });
        let id = self.register(filter, Handler::Sync(handler));
        (id, UnboundedReceiverStream::new(rx))
    }

    fn register(&self, filter: Option<EventType>, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations.write().push(Registration { id, filter, handler });
        id
    }

    /// Remove a registration; returns whether it existed
    pub fn off(&self, id: HandlerId) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    /// Remove every registration
    pub fn clear(&self) {
        self.registrations.write().clear();
    }

    /// Number of handlers that would receive events of `event_type`, or the
    /// total number of registrations for `None`
    pub fn handler_count(&self, event_type: Option<EventType>) -> usize {
        let registrations = self.registrations.read();
        match event_type {
            Some(t) => registrations.iter().filter(|r| r.matches(t)).count(),
            None => registrations.len(),
        }
    }

    /// Deliver `event` to matching synchronous handlers
    pub fn emit(&self, event: &Event) {
        let failures = self.deliver_sync(event, None);
        if failures.is_empty() || event.event_type() == EventType::HandlerFailed {
            return;
        }
        for failure in failures {
            let report = failure_event(event, &failure);
            for nested in self.deliver_sync(&report, Some(failure.handler_id)) {
                log_failure(&report, &nested);
            }
        }
    }

    /// Deliver `event` to every matching handler, awaiting async ones
    pub async fn emit_async(&self, event: Event) {
        let failures = self.deliver_all(&event, None).await;
        if failures.is_empty() || event.event_type() == EventType::HandlerFailed {
            return;
        }
        for failure in failures {
            let report = failure_event(&event, &failure);
            for nested in self.deliver_all(&report, Some(failure.handler_id)).await {
                log_failure(&report, &nested);
            }
        }
    }

    fn matching(&self, event_type: EventType, skip: Option<HandlerId>) -> Vec<Registration> {
        self.registrations
            .read()
            .iter()
            .filter(|r| r.matches(event_type) && Some(r.id) != skip)
            .cloned()
            .collect()
    }

    fn deliver_sync(&self, event: &Event, skip: Option<HandlerId>) -> Vec<Failure> {
        let mut failures = Vec::new();
        for registration in self.matching(event.event_type(), skip) {
            if let Handler::Sync(handler) = &registration.handler {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
                self.record(event, registration.id, outcome, &mut failures);
            }
        }
        failures
    }

    async fn deliver_all(&self, event: &Event, skip: Option<HandlerId>) -> Vec<Failure> {
        let mut failures = Vec::new();
        for registration in self.matching(event.event_type(), skip) {
            let outcome = match &registration.handler {
                Handler::Sync(handler) => panic::catch_unwind(AssertUnwindSafe(|| handler(event))),
                Handler::Async(handler) => {
                    match panic::catch_unwind(AssertUnwindSafe(|| handler(event.clone()))) {
                        Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                        Err(panic) => Err(panic),
                    }
                }
            };
            self.record(event, registration.id, outcome, &mut failures);
        }
        failures
    }

    fn record(
        &self,
        event: &Event,
        handler_id: HandlerId,
        outcome: std::result::Result<HandlerResult, Box<dyn Any + Send>>,
        failures: &mut Vec<Failure>,
    ) {
        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
        };
        let failure = Failure { handler_id, error };
        log_failure(event, &failure);
        failures.push(failure);
    }
}

fn boxed_async<F, Fut>(handler: F) -> AsyncHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |event| handler(event).boxed())
}

fn failure_event(event: &Event, failure: &Failure) -> Event {
    Event::new(EventPayload::HandlerFailed {
        handler_id: failure.handler_id,
        event_type: event.event_type(),
        error: failure.error.clone(),
    })
}

fn log_failure(event: &Event, failure: &Failure) {
    tracing::warn!(
        handler = %failure.handler_id,
        event = ?event.event_type(),
        error = %failure.error,
        "Event handler failed"
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn started(superstep: usize) -> Event {
        Event::new(EventPayload::SuperstepStarted {
            superstep,
            active_nodes: vec![],
        })
    }

    #[test]
    fn test_filtering_and_counts() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let typed = hits.clone();
        bus.on(EventType::SuperstepStarted, move |_| {
            typed.lock().push("typed");
            Ok(())
        });
        let any = hits.clone();
        let any_id = bus.on_any(move |_| {
            any.lock().push("any");
            Ok(())
        });
        bus.on(EventType::NodeError, |_| Ok(()));

        assert_eq!(bus.handler_count(None), 3);
        assert_eq!(bus.handler_count(Some(EventType::SuperstepStarted)), 2);
        assert_eq!(bus.handler_count(Some(EventType::WorkflowStarted)), 1);

        bus.emit(&started(0));
        assert_eq!(*hits.lock(), vec!["typed", "any"]);

        assert!(bus.off(any_id));
        assert!(!bus.off(any_id));
        bus.emit(&started(1));
        assert_eq!(hits.lock().len(), 3);

        bus.clear();
        assert_eq!(bus.handler_count(None), 0);
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let bus = EventBus::new();
        let delivered = Arc::new(Mutex::new(Vec::new()));

        bus.on(EventType::SuperstepStarted, |_| Err("refused".into()));
        bus.on(EventType::SuperstepStarted, |_| panic!("exploded"));
        let sink = delivered.clone();
        bus.on_any(move |event| {
            sink.lock().push(event.payload.clone());
            Ok(())
        });

        bus.emit(&started(3));

        let delivered = delivered.lock();
        assert!(matches!(delivered[0], EventPayload::SuperstepStarted { superstep: 3, .. }));
        let reports: Vec<_> = delivered
            .iter()
            .filter_map(|p| match p {
                EventPayload::HandlerFailed { error, event_type, .. } => Some((error.clone(), *event_type)),
                _ => None,
            })
            .collect();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0], ("refused".to_string(), EventType::SuperstepStarted));
        assert!(reports[1].0.contains("exploded"));
    }

    #[test]
    fn test_failure_reports_do_not_recurse() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU64::new(0));

        let counter = calls.clone();
        bus.on_any(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("always fails".into())
        });
        let counter = calls.clone();
        bus.on_any(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("also fails".into())
        });

        bus.emit(&started(0));
        // Two deliveries of the event, then each report goes to the other handler once.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_emit_async_preserves_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let slow = order.clone();
        bus.on_async(EventType::NodeError, move |_| {
            let slow = slow.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                slow.lock().push("slow-async");
                Ok(())
            }
        });
        let sync = order.clone();
        bus.on(EventType::NodeError, move |_| {
            sync.lock().push("sync");
            Ok(())
        });
        let fast = order.clone();
        bus.on_any_async(move |_| {
            let fast = fast.clone();
            async move {
                fast.lock().push("fast-async");
                Ok(())
            }
        });

        let event = Event::new(EventPayload::NodeError {
            node_id: "n".into(),
            error: "boom".into(),
            error_kind: "node_execution".into(),
            attempt: 0,
        });

        bus.emit(&event);
        assert_eq!(*order.lock(), vec!["sync"]);

        order.lock().clear();
        bus.emit_async(event).await;
        assert_eq!(*order.lock(), vec!["slow-async", "sync", "fast-async"]);
    }

    #[tokio::test]
    async fn test_async_handler_panic_is_isolated() {
        let bus = EventBus::new();
        let after = Arc::new(AtomicU64::new(0));

        bus.on_any_async(|event: Event| async move {
            if event.event_type() == EventType::SuperstepStarted {
                panic!("async boom");
            }
            Ok(())
        });
        let counter = after.clone();
        bus.on(EventType::SuperstepStarted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit_async(started(0)).await;
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_streams_events() {
        let bus = EventBus::new();
        let (_id, mut stream) = bus.subscribe(Some(EventType::SuperstepStarted));

        bus.emit(&started(0));
        bus.emit(&Event::new(EventPayload::SuperstepCompleted {
            superstep: 0,
            nodes_executed: 1,
            messages_sent: 0,
        }));
        bus.emit_async(started(1)).await;

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert!(matches!(first.payload, EventPayload::SuperstepStarted { superstep: 0, .. }));
        assert!(matches!(second.payload, EventPayload::SuperstepStarted { superstep: 1, .. }));
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = Event::new(EventPayload::Recovery {
            node_id: "fetch".into(),
            action: ErrorPolicy::Skip,
            success: true,
            attempt: 1,
        });
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "recovery");
        assert_eq!(json["data"]["node_id"], "fetch");
        assert_eq!(json["data"]["action"], "skip");
        assert!(json["timestamp"].is_string());
    }
}
