//! The superstep loop.
//!
//! Each round drains the message queues, runs every active node
//! concurrently against one shared state snapshot, then applies outputs and
//! routes messages in the order the nodes finished.

use super::messages::MessageQueues;
use super::stats::StatsHandle;
use super::EngineStatus;
use crate::config::EngineConfig;
use crate::error::{FatalError, GraphError, Result};
use crate::error_handler::{ErrorHandler, Recovery};
use crate::events::{Event, EventBus, EventPayload};
use crate::graph::{Graph, Node, NodeId};
use crate::retry::RetryState;
use crate::state::{StateMap, StateStore, StateView};
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;

/// Reserved input key carrying the current superstep number
pub const SUPERSTEP_KEY: &str = "__superstep";
/// Reserved input key carrying the id of the node being invoked
pub const NODE_ID_KEY: &str = "__node_id";

/// Output of one node activation, after any recovery
struct NodeOutput {
    output: StateMap,
    recovered: bool,
}

/// A finished activation as reported back to the round
struct Activation {
    node_id: NodeId,
    elapsed: Duration,
    outcome: Result<NodeOutput>,
}

/// Escalated failure inside a round
struct RoundFailure {
    error: GraphError,
    node_id: Option<NodeId>,
}

impl RoundFailure {
    fn new(error: GraphError, node_id: Option<NodeId>) -> Self {
        Self { error, node_id }
    }
}

/// Everything one run needs, borrowed from the engine
pub(crate) struct Scheduler<'a> {
    pub(crate) graph: &'a Arc<Graph>,
    pub(crate) config: &'a EngineConfig,
    pub(crate) store: StateStore,
    pub(crate) handler: &'a Arc<ErrorHandler>,
    pub(crate) events: &'a Arc<EventBus>,
    pub(crate) stats: &'a StatsHandle,
    pub(crate) status: &'a RwLock<EngineStatus>,
}

impl Scheduler<'_> {
    /// Drive supersteps until no node has pending input.
    pub(crate) async fn run(self, initial: StateMap, run_id: String) -> std::result::Result<StateMap, FatalError> {
        let graph_id = self.graph.graph_id().to_string();
        let span = tracing::info_span!("workflow", graph_id = %graph_id, run_id = %run_id);
        self.run_inner(initial, graph_id, run_id).instrument(span).await
    }

    async fn run_inner(
        self,
        initial: StateMap,
        graph_id: String,
        run_id: String,
    ) -> std::result::Result<StateMap, FatalError> {
        let started = Instant::now();
        // A deadline too far out to represent is no deadline at all.
        let deadline = self.config.timeout().and_then(|limit| started.checked_add(limit));
        let start_node = self.graph.start_node_id().to_string();

        self.stats.begin();
        *self.status.write() = EngineStatus::Running { superstep: 0 };
        tracing::info!(start = %start_node, nodes = self.graph.len(), "Workflow started");
        self.publish(EventPayload::WorkflowStarted {
            graph_id: graph_id.clone(),
            run_id: run_id.clone(),
            start_node: start_node.clone(),
        })
        .await;

        let mut queues = MessageQueues::new();
        queues.push(start_node, initial);
        let mut superstep = 0;

        loop {
            if queues.is_empty() {
                break;
            }

            let failure = if superstep >= self.config.max_iterations {
                Some(GraphError::IterationLimit {
                    max_iterations: self.config.max_iterations,
                })
            } else {
                deadline
                    .filter(|deadline| Instant::now() >= *deadline)
                    .map(|_| GraphError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })
            };
            if let Some(error) = failure {
                return Err(self
                    .fail(RoundFailure::new(error, None), superstep, &graph_id, &run_id)
                    .await);
            }

            *self.status.write() = EngineStatus::Running { superstep };
            if let Err(failure) = self.execute_superstep(superstep, &mut queues).await {
                return Err(self.fail(failure, superstep, &graph_id, &run_id).await);
            }
            superstep += 1;
        }

        self.stats.finish();
        *self.status.write() = EngineStatus::Completed;
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(supersteps = superstep, duration_ms, "Workflow completed");
        self.publish(EventPayload::WorkflowCompleted {
            graph_id,
            run_id,
            total_supersteps: superstep,
            duration_ms,
        })
        .await;

        Ok(self.store.snapshot())
    }

    async fn fail(
        &self,
        failure: RoundFailure,
        superstep: usize,
        graph_id: &str,
        run_id: &str,
    ) -> FatalError {
        self.stats.finish();
        *self.status.write() = EngineStatus::Failed;
        tracing::error!(
            superstep,
            node = ?failure.node_id,
            error = %failure.error,
            "Workflow failed"
        );
        self.publish(EventPayload::WorkflowFailed {
            graph_id: graph_id.to_string(),
            run_id: run_id.to_string(),
            superstep,
            node_id: failure.node_id.clone(),
            error: failure.error.to_string(),
        })
        .await;

        FatalError::new(failure.error, failure.node_id, superstep, self.store.snapshot())
    }

    async fn execute_superstep(
        &self,
        superstep: usize,
        queues: &mut MessageQueues,
    ) -> std::result::Result<(), RoundFailure> {
        let inbox = queues.drain();
        let active: Vec<NodeId> = inbox.iter().map(|(id, _)| id.clone()).collect();
        tracing::debug!(superstep, active = ?active, "Superstep started");
        self.publish(EventPayload::SuperstepStarted {
            superstep,
            active_nodes: active,
        })
        .await;

        let round_snapshot = self.store.snapshot();
        let view = StateView::new(round_snapshot.clone());

        let mut tasks = JoinSet::new();
        for (node_id, messages) in inbox {
            let node = self.graph.node(&node_id).cloned().ok_or_else(|| {
                RoundFailure::new(
                    GraphError::Validation(format!("message addressed to unknown node '{node_id}'")),
                    Some(node_id.clone()),
                )
            })?;
            let input = aggregate_input(&view, messages, superstep, &node_id);
            let handler = Arc::clone(self.handler);
            let span = tracing::debug_span!("node", node = %node_id, superstep);
            tasks.spawn(activate(node, input, handler).instrument(span));
        }

        // Every activation finishes before any output is applied.
        let mut finished = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(activation) => finished.push(activation),
                Err(join_err) => {
                    self.store.restore(round_snapshot);
                    return Err(RoundFailure::new(
                        GraphError::node_execution("<task>", join_err),
                        None,
                    ));
                }
            }
        }

        let nodes_executed = finished.len();
        let mut messages_sent = 0;
        let mut changes = Vec::new();
        for activation in finished {
            if let Err(failure) = self
                .apply(activation, superstep, queues, &mut messages_sent, &mut changes)
                .await
            {
                self.store.restore(round_snapshot);
                return Err(failure);
            }
        }

        // State changes are only announced once the round can no longer roll back.
        self.store.publish(changes);
        self.stats.superstep_completed(messages_sent);
        tracing::debug!(superstep, nodes_executed, messages_sent, "Superstep completed");
        self.publish(EventPayload::SuperstepCompleted {
            superstep,
            nodes_executed,
            messages_sent,
        })
        .await;
        Ok(())
    }

    /// Write one activation's output and route it along matching edges.
    async fn apply(
        &self,
        activation: Activation,
        superstep: usize,
        queues: &mut MessageQueues,
        messages_sent: &mut usize,
        changes: &mut Vec<Event>,
    ) -> std::result::Result<(), RoundFailure> {
        let Activation {
            node_id,
            elapsed,
            outcome,
        } = activation;
        let NodeOutput { output, recovered } =
            outcome.map_err(|error| RoundFailure::new(error, Some(node_id.clone())))?;

        let written = self
            .store
            .update_deferred(output.clone(), self.config.output_strategy, &node_id)
            .map_err(|error| RoundFailure::new(error, Some(node_id.clone())))?;
        changes.extend(written);
        self.stats.node_finished(&node_id, elapsed, recovered);

        let current = self.store.view();
        for edge in self.graph.outgoing(&node_id) {
            let forward = edge
                .condition
                .evaluate(&output, &current)
                .map_err(|e| RoundFailure::new(GraphError::condition(&node_id, &edge.target, e), Some(node_id.clone())))?;
            if forward {
                tracing::trace!(from = %node_id, to = %edge.target, "Routing message");
                queues.push(edge.target.clone(), output.clone());
                *messages_sent += 1;
            }
        }

        self.publish(EventPayload::NodeCompleted {
            node_id,
            superstep,
            duration_ms: elapsed.as_millis() as u64,
            output,
        })
        .await;
        Ok(())
    }

    async fn publish(&self, payload: EventPayload) {
        self.events.emit_async(Event::new(payload)).await;
    }
}

/// Build a node's input: the round snapshot, then each message in arrival
/// order (later keys win), then the reserved keys.
fn aggregate_input(view: &StateView, messages: Vec<StateMap>, superstep: usize, node_id: &str) -> StateMap {
    let mut input = view.to_map();
    for message in messages {
        input.extend(message);
    }
    input.insert(SUPERSTEP_KEY.to_string(), Value::from(superstep));
    input.insert(NODE_ID_KEY.to_string(), Value::String(node_id.to_string()));
    input
}

/// Run one activation to an output or a fatal error.
///
/// Retries happen here, inside the node's own task, so a backing-off node
/// never delays its siblings.
async fn activate(node: Node, input: StateMap, handler: Arc<ErrorHandler>) -> Activation {
    let node_id = node.id().to_string();
    let started = Instant::now();
    let guarded = AssertUnwindSafe(run_with_policy(&node, &input, &handler)).catch_unwind();
    let outcome = match guarded.await {
        Ok(outcome) => outcome,
        Err(panic) => Err(GraphError::node_execution(
            &node_id,
            format!("error handling panicked: {}", panic_message(panic.as_ref())),
        )),
    };

    Activation {
        node_id,
        elapsed: started.elapsed(),
        outcome,
    }
}

async fn run_with_policy(node: &Node, input: &StateMap, handler: &ErrorHandler) -> Result<NodeOutput> {
    let mut retry = RetryState::new();
    loop {
        tracing::debug!(attempt = retry.attempts, "Executing node");
        match invoke(node, input.clone()).await {
            Ok(output) => {
                if retry.attempts > 0 {
                    tracing::info!(attempts = retry.attempts + 1, "Node succeeded after retry");
                }
                return Ok(NodeOutput {
                    output: strip_reserved(output),
                    recovered: false,
                });
            }
            Err(error) => {
                retry.record_attempt(error.to_string());
                match handler.handle(node.id(), error, input, retry.attempts - 1).await? {
                    Recovery::Retry { .. } => continue,
                    Recovery::Output(output) => {
                        return Ok(NodeOutput {
                            output: strip_reserved(output),
                            recovered: true,
                        })
                    }
                }
            }
        }
    }
}

/// One executor call, with the node's timeout and panic capture applied.
async fn invoke(node: &Node, input: StateMap) -> Result<StateMap> {
    let call = AssertUnwindSafe(node.executor().execute(input)).catch_unwind();
    let outcome = match node.config().timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(GraphError::node_execution(
                    node.id(),
                    format!("timed out after {}ms", limit.as_millis()),
                ))
            }
        },
        None => call.await,
    };

    match outcome {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(GraphError::node_execution(node.id(), e)),
        Err(panic) => Err(GraphError::node_execution(
            node.id(),
            format!("panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

/// Reserved keys describe one invocation and never reach the state.
fn strip_reserved(mut output: StateMap) -> StateMap {
    output.remove(SUPERSTEP_KEY);
    output.remove(NODE_ID_KEY);
    output
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
    use serde_json::json;

    #[test]
    fn test_aggregate_input_order() {
        let view = StateView::new(json!({"a": 0, "keep": true}).as_object().cloned().unwrap());
        let messages = vec![
            json!({"a": 1, "b": 1}).as_object().cloned().unwrap(),
            json!({"a": 2}).as_object().cloned().unwrap(),
        ];

        let input = aggregate_input(&view, messages, 3, "join");
        assert_eq!(input["a"], json!(2));
        assert_eq!(input["b"], json!(1));
        assert_eq!(input["keep"], json!(true));
        assert_eq!(input[SUPERSTEP_KEY], json!(3));
        assert_eq!(input[NODE_ID_KEY], json!("join"));
    }

    #[test]
    fn test_strip_reserved() {
        let output = json!({"x": 1, "__superstep": 2, "__node_id": "n"})
            .as_object()
            .cloned()
            .unwrap();
        let stripped = strip_reserved(output);
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped["x"], json!(1));
    }
}
