//! Per-node failure policies
//!
//! When a node invocation fails, the scheduler asks the [`ErrorHandler`]
//! what to do. The handler resolves the node's [`ErrorPolicy`] (a per-node
//! override, else the default) and either absorbs the failure or escalates
//! it:
//!
//! | Policy | Outcome |
//! |--------|---------|
//! | `fail_fast` | escalate the error |
//! | `retry` | sleep with backoff and ask for another attempt; escalate `RetryExhausted` when out of retries |
//! | `skip` | substitute `{"error": <message>, "skipped": true}` as the node output |
//! | `custom` | substitute the output of a registered callback; a callback error escalates |
//!
//! A `NodeError` event is published before the policy runs and a `Recovery`
//! event after it, including when the outcome is an escalation.

use crate::error::{BoxError, GraphError, Result};
use crate::events::{Event, EventBus, EventPayload};
use crate::graph::NodeId;
use crate::retry::RetryPolicy;
use crate::state::StateMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How failures of a node are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    FailFast,
    #[default]
    Retry,
    Skip,
    Custom,
}

/// Non-fatal outcome of [`ErrorHandler::handle`]
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// Invoke the executor again; the delay has already elapsed
    Retry { attempt: u32, delay: Duration },
    /// Use this record as the node's output
    Output(StateMap),
}

/// Callback used by the `custom` policy: `(node_id, error, input) -> output`
pub type CustomHandler =
    Arc<dyn Fn(&str, &GraphError, &StateMap) -> std::result::Result<StateMap, BoxError> + Send + Sync>;

/// Replacement delay schedule for one node: `attempt -> delay`
pub type RetryDelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Configuration report produced by [`ErrorHandler::summary`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlerSummary {
    pub default_policy: ErrorPolicy,
    pub node_policies: HashMap<NodeId, ErrorPolicy>,
    pub retry: RetryPolicy,
    pub retry_overrides: Vec<NodeId>,
    pub custom_handlers: Vec<NodeId>,
    pub custom_delays: Vec<NodeId>,
}

/// Resolves and applies error policies
pub struct ErrorHandler {
    default_policy: ErrorPolicy,
    node_policies: HashMap<NodeId, ErrorPolicy>,
    retry: RetryPolicy,
    retry_overrides: HashMap<NodeId, RetryPolicy>,
    custom_handlers: HashMap<NodeId, CustomHandler>,
    delay_fns: HashMap<NodeId, RetryDelayFn>,
    events: Option<Arc<EventBus>>,
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("default_policy", &self.default_policy)
            .field("node_policies", &self.node_policies)
            .field("retry", &self.retry)
            .field("custom_handlers", &self.custom_handlers.len())
            .finish()
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(ErrorPolicy::default(), RetryPolicy::default())
    }
}

impl ErrorHandler {
    pub fn new(default_policy: ErrorPolicy, retry: RetryPolicy) -> Self {
        Self {
            default_policy,
            node_policies: HashMap::new(),
            retry,
            retry_overrides: HashMap::new(),
            custom_handlers: HashMap::new(),
            delay_fns: HashMap::new(),
            events: None,
        }
    }

    /// Publish `NodeError` and `Recovery` events on `bus`
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Override the policy for one node
    pub fn set_policy(&mut self, node_id: impl Into<NodeId>, policy: ErrorPolicy) {
        self.node_policies.insert(node_id.into(), policy);
    }

    /// Replace the retry settings for one node
    pub fn set_retry_override(&mut self, node_id: impl Into<NodeId>, retry: RetryPolicy) {
        self.retry_overrides.insert(node_id.into(), retry);
    }

    /// Register the callback used when `node_id` runs under the `custom` policy
    pub fn register_custom_handler<F>(&mut self, node_id: impl Into<NodeId>, handler: F)
    where
        F: Fn(&str, &GraphError, &StateMap) -> std::result::Result<StateMap, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.custom_handlers.insert(node_id.into(), Arc::new(handler));
    }

    /// Replace the backoff schedule for one node
    pub fn register_retry_delay<F>(&mut self, node_id: impl Into<NodeId>, delay: F)
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.delay_fns.insert(node_id.into(), Arc::new(delay));
    }

    /// Effective policy for `node_id`
    pub fn policy_for(&self, node_id: &str) -> ErrorPolicy {
        self.node_policies
            .get(node_id)
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// Effective retry settings for `node_id`
    pub fn retry_policy_for(&self, node_id: &str) -> &RetryPolicy {
        self.retry_overrides.get(node_id).unwrap_or(&self.retry)
    }

    /// Decide how to treat a failed invocation of `node_id`.
    ///
    /// `attempt` counts prior retries of this activation (0 on the first
    /// failure). `context` is the input the node was invoked with.
    ///
    /// # Errors
    ///
    /// Returns the error to escalate: the original error for `fail_fast`,
    /// [`GraphError::RetryExhausted`] when retries run out, or a
    /// [`GraphError::NodeExecution`] / [`GraphError::Configuration`] when the
    /// `custom` policy cannot produce an output.
    pub async fn handle(
        &self,
        node_id: &str,
        error: GraphError,
        context: &StateMap,
        attempt: u32,
    ) -> Result<Recovery> {
        let message = failure_message(&error);
        self.publish(EventPayload::NodeError {
            node_id: node_id.to_string(),
            error: message.clone(),
            error_kind: error.kind().to_string(),
            attempt,
        })
        .await;

        let policy = self.policy_for(node_id);
        let outcome = match policy {
            ErrorPolicy::FailFast => {
                tracing::error!(node = %node_id, error = %message, "Node failed under fail-fast policy");
                Err(error)
            }
            ErrorPolicy::Retry => self.retry(node_id, message, attempt).await,
            ErrorPolicy::Skip => {
                tracing::warn!(node = %node_id, error = %message, "Skipping failed node");
                let mut output = StateMap::new();
                output.insert("error".to_string(), Value::String(message));
                output.insert("skipped".to_string(), Value::Bool(true));
                Ok(Recovery::Output(output))
            }
            ErrorPolicy::Custom => self.custom(node_id, &error, context),
        };

        self.publish(EventPayload::Recovery {
            node_id: node_id.to_string(),
            action: policy,
            success: outcome.is_ok(),
            attempt,
        })
        .await;

        outcome
    }

    async fn retry(&self, node_id: &str, message: String, attempt: u32) -> Result<Recovery> {
        let policy = self.retry_policy_for(node_id);
        if !policy.should_retry(attempt) {
            tracing::error!(
                node = %node_id,
                attempts = attempt + 1,
                error = %message,
                "Retries exhausted"
            );
            return Err(GraphError::RetryExhausted {
                node: node_id.to_string(),
                attempts: attempt + 1,
                last_error: message,
            });
        }

        let delay = match self.delay_fns.get(node_id) {
            Some(delay_fn) => delay_fn(attempt),
            None => policy.calculate_delay(node_id, attempt),
        };

        tracing::warn!(
            node = %node_id,
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "Node failed, retrying"
        );
        tokio::time::sleep(delay).await;

        Ok(Recovery::Retry {
            attempt: attempt + 1,
            delay,
        })
    }

    fn custom(&self, node_id: &str, error: &GraphError, context: &StateMap) -> Result<Recovery> {
        let handler = self.custom_handlers.get(node_id).ok_or_else(|| {
            GraphError::Configuration(format!(
                "node '{node_id}' uses the custom error policy but no handler is registered"
            ))
        })?;

        match handler(node_id, error, context) {
            Ok(output) => {
                tracing::warn!(node = %node_id, "Custom error handler recovered node");
                Ok(Recovery::Output(output))
            }
            Err(e) => {
                tracing::error!(node = %node_id, error = %e, "Custom error handler failed");
                Err(GraphError::node_execution(
                    node_id,
                    format!("custom error handler failed: {e}"),
                ))
            }
        }
    }

    /// Report of the handler configuration
    pub fn summary(&self) -> ErrorHandlerSummary {
        let sorted = |keys: Vec<&NodeId>| {
            let mut keys: Vec<NodeId> = keys.into_iter().cloned().collect();
            keys.sort();
            keys
        };
        ErrorHandlerSummary {
            default_policy: self.default_policy,
            node_policies: self.node_policies.clone(),
            retry: self.retry.clone(),
            retry_overrides: sorted(self.retry_overrides.keys().collect()),
            custom_handlers: sorted(self.custom_handlers.keys().collect()),
            custom_delays: sorted(self.delay_fns.keys().collect()),
        }
    }

    async fn publish(&self, payload: EventPayload) {
        if let Some(bus) = &self.events {
            bus.emit_async(Event::new(payload)).await;
        }
    }
}

/// Message without the node prefix added by `NodeExecution`
fn failure_message(error: &GraphError) -> String {
    match error {
        GraphError::NodeExecution { error, .. } => error.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use parking_lot::Mutex;
    use serde_json::json;

    fn failure() -> GraphError {
        GraphError::node_execution("n", "boom")
    }

    fn quick_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries)
            .with_base_delay(0.01)
            .with_jitter(false)
    }

    #[tokio::test]
    async fn test_fail_fast_escalates_original_error() {
        let handler = ErrorHandler::new(ErrorPolicy::FailFast, RetryPolicy::default());
        let err = handler.handle("n", failure(), &StateMap::new(), 0).await.unwrap_err();
        assert!(matches!(err, GraphError::NodeExecution { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_exhaustion() {
        let handler = ErrorHandler::new(ErrorPolicy::Retry, RetryPolicy::new(2).with_jitter(false));

        let first = handler.handle("n", failure(), &StateMap::new(), 0).await.unwrap();
        assert_eq!(
            first,
            Recovery::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        let second = handler.handle("n", failure(), &StateMap::new(), 1).await.unwrap();
        assert_eq!(
            second,
            Recovery::Retry {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );

        let err = handler.handle("n", failure(), &StateMap::new(), 2).await.unwrap_err();
        match err {
            GraphError::RetryExhausted { node, attempts, last_error } => {
                assert_eq!(node, "n");
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_skip_substitutes_marker_output() {
        let mut handler = ErrorHandler::default();
        handler.set_policy("n", ErrorPolicy::Skip);

        let recovery = handler.handle("n", failure(), &StateMap::new(), 0).await.unwrap();
        let Recovery::Output(output) = recovery else {
            panic!("expected substituted output");
        };
        assert_eq!(output["error"], json!("boom"));
        assert_eq!(output["skipped"], json!(true));
    }

    #[tokio::test]
    async fn test_custom_handler_recovers_with_context() {
        let mut handler = ErrorHandler::new(ErrorPolicy::Custom, RetryPolicy::default());
        handler.register_custom_handler("n", |node_id, error, context| {
            let mut output = StateMap::new();
            output.insert("recovered_by".into(), json!(node_id));
            output.insert("reason".into(), json!(error.to_string()));
            output.insert("seen_input".into(), json!(context.contains_key("q")));
            Ok(output)
        });

        let mut context = StateMap::new();
        context.insert("q".into(), json!("query"));
        let Recovery::Output(output) = handler.handle("n", failure(), &context, 0).await.unwrap() else {
            panic!("expected substituted output");
        };
        assert_eq!(output["recovered_by"], json!("n"));
        assert_eq!(output["seen_input"], json!(true));
    }

    #[tokio::test]
    async fn test_custom_handler_error_is_fatal() {
        let mut handler = ErrorHandler::new(ErrorPolicy::Custom, RetryPolicy::default());
        handler.register_custom_handler("n", |_, _, _| Err("cannot recover".into()));

        let err = handler.handle("n", failure(), &StateMap::new(), 0).await.unwrap_err();
        assert!(err.to_string().contains("cannot recover"));
    }

    #[tokio::test]
    async fn test_custom_without_handler_is_fatal() {
        let handler = ErrorHandler::new(ErrorPolicy::Custom, RetryPolicy::default());
        let err = handler.handle("n", failure(), &StateMap::new(), 0).await.unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_overrides_and_delay_fn() {
        let mut handler = ErrorHandler::new(ErrorPolicy::Retry, quick_retry(3));
        handler.set_retry_override("fragile", quick_retry(0));
        handler.register_retry_delay("custom_delay", |attempt| Duration::from_millis(u64::from(attempt) + 1));

        assert_eq!(handler.retry_policy_for("fragile").max_retries, 0);
        assert_eq!(handler.retry_policy_for("other").max_retries, 3);
        assert!(handler.handle("fragile", failure(), &StateMap::new(), 0).await.is_err());

        let recovery = handler
            .handle("custom_delay", failure(), &StateMap::new(), 1)
            .await
            .unwrap();
        assert_eq!(
            recovery,
            Recovery::Retry {
                attempt: 2,
                delay: Duration::from_millis(2)
            }
        );

        let summary = handler.summary();
        assert_eq!(summary.retry_overrides, vec!["fragile".to_string()]);
        assert_eq!(summary.custom_delays, vec!["custom_delay".to_string()]);
    }

    #[tokio::test]
    async fn test_events_published_for_fatal_outcomes() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on_any(move |event| {
            sink.lock().push(event.payload.clone());
            Ok(())
        });

        let handler = ErrorHandler::new(ErrorPolicy::FailFast, RetryPolicy::default()).with_event_bus(bus);
        let _ = handler.handle("n", failure(), &StateMap::new(), 0).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event_type(), EventType::NodeError);
        assert_eq!(
            seen[1],
            EventPayload::Recovery {
                node_id: "n".into(),
                action: ErrorPolicy::FailFast,
                success: false,
                attempt: 0,
            }
        );
    }
}
