//! Superstep execution engine
//!
//! The [`Engine`] runs a [`Graph`] in bulk-synchronous rounds:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ superstep N                                                │
//! │                                                            │
//! │  1. activation   nodes with queued messages                │
//! │  2. snapshot     one StateView shared by the round         │
//! │  3. input        snapshot + messages + __superstep/__node_id│
//! │  4. dispatch     one tokio task per node, all joined       │
//! │  5. apply        write output, evaluate edges, enqueue     │
//! │                  (in completion order)                     │
//! └──────────────────────────┬─────────────────────────────────┘
//!                            ▼
//!                      superstep N + 1
//! ```
//!
//! A run completes when no node has pending input. It fails when the error
//! policy escalates a node failure, a state write or edge predicate errors,
//! the iteration cap is reached with work pending, or the deadline passes.
//! On failure the state is rolled back to the end of the previous round and
//! returned inside the [`FatalError`]. `StateChanged` events of a round are
//! held back until all of its outputs are applied, so a rolled-back round
//! publishes none.
//!
//! Nodes active in the same round that write the same key race: the write
//! applied last wins. Give parallel branches disjoint keys, or set
//! `output_strategy` to `merge` and register a reducer for the shared key.
//!
//! ```rust,no_run
//! use superstep_core::engine::Engine;
//! use superstep_core::graph::{Edge, Graph, Node};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = Graph::new(
//!     "hello",
//!     vec![Node::from_fn("greet", |mut input| async move {
//!         input.insert("greeting".into(), "hello".into());
//!         Ok(input)
//!     })],
//!     vec![],
//!     "greet",
//! )?;
//!
//! let engine = Engine::builder(Arc::new(graph)).build()?;
//! let state = engine.run().await?;
//! assert_eq!(state["greeting"], "hello");
//! # Ok(())
//! # }
//! ```

mod messages;
mod scheduler;
mod stats;

pub use messages::MessageQueues;
pub use scheduler::{NODE_ID_KEY, SUPERSTEP_KEY};
pub use stats::{ExecutionStats, Progress, StatsHandle};

use crate::config::EngineConfig;
use crate::error::{BoxError, FatalError, GraphError, Result};
use crate::error_handler::{ErrorHandler, ErrorHandlerSummary, ErrorPolicy};
use crate::events::EventBus;
use crate::graph::{Graph, NodeId};
use crate::state::{FnReducer, Reducer, StateMap, StateStore};
use parking_lot::RwLock;
use scheduler::Scheduler;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle of an [`Engine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EngineStatus {
    Idle,
    Running { superstep: usize },
    Completed,
    Failed,
}

/// Configured, reusable executor for one graph
pub struct Engine {
    graph: Arc<Graph>,
    config: EngineConfig,
    initial_state: StateMap,
    events: Arc<EventBus>,
    handler: Arc<ErrorHandler>,
    reducers: Vec<(String, Arc<dyn Reducer>)>,
    stats: StatsHandle,
    status: RwLock<EngineStatus>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("graph_id", &self.graph.graph_id())
            .field("config", &self.config)
            .field("status", &*self.status.read())
            .finish()
    }
}

impl Engine {
    /// Start configuring an engine for `graph`
    pub fn builder(graph: Arc<Graph>) -> EngineBuilder {
        EngineBuilder::new(graph)
    }

    /// Execute the graph from its start node.
    ///
    /// Each call is an independent run over a fresh copy of the initial
    /// state; statistics are reset at the start of every run.
    pub async fn run(&self) -> std::result::Result<StateMap, FatalError> {
        let store = StateStore::with_initial(self.initial_state.clone()).with_event_bus(Arc::clone(&self.events));
        for (key, reducer) in &self.reducers {
            store.install_reducer(key.clone(), Arc::clone(reducer));
        }

        let scheduler = Scheduler {
            graph: &self.graph,
            config: &self.config,
            store,
            handler: &self.handler,
            events: &self.events,
            stats: &self.stats,
            status: &self.status,
        };
        scheduler
            .run(self.initial_state.clone(), Uuid::new_v4().to_string())
            .await
    }

    /// Execute on a dedicated multi-thread runtime, blocking the caller.
    ///
    /// Must not be called from within an async context.
    pub fn run_blocking(&self) -> std::result::Result<StateMap, FatalError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| FatalError::new(GraphError::Io(e), None, 0, self.initial_state.clone()))?;
        runtime.block_on(self.run())
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bus carrying this engine's lifecycle events
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.read()
    }

    /// Copy of the statistics of the current or last run
    pub fn stats(&self) -> ExecutionStats {
        self.stats.snapshot()
    }

    /// Handle for reading statistics from another task while running
    pub fn stats_handle(&self) -> StatsHandle {
        self.stats.clone()
    }

    pub fn progress(&self) -> Progress {
        self.stats.progress(self.status(), self.graph.len())
    }

    /// Error policy configuration in effect
    pub fn error_summary(&self) -> ErrorHandlerSummary {
        self.handler.summary()
    }
}

type CustomHandlerFn =
    Box<dyn Fn(&str, &GraphError, &StateMap) -> std::result::Result<StateMap, BoxError> + Send + Sync>;
type DelayFn = Box<dyn Fn(u32) -> Duration + Send + Sync>;

/// Builder for [`Engine`]
pub struct EngineBuilder {
    graph: Arc<Graph>,
    config: EngineConfig,
    initial_state: StateMap,
    events: Option<Arc<EventBus>>,
    node_policies: Vec<(NodeId, ErrorPolicy)>,
    custom_handlers: Vec<(NodeId, CustomHandlerFn)>,
    delay_fns: Vec<(NodeId, DelayFn)>,
    reducers: Vec<(String, Arc<dyn Reducer>)>,
}

impl EngineBuilder {
    fn new(graph: Arc<Graph>) -> Self {
        Self {
            graph,
            config: EngineConfig::default(),
            initial_state: StateMap::new(),
            events: None,
            node_policies: Vec::new(),
            custom_handlers: Vec::new(),
            delay_fns: Vec::new(),
            reducers: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn initial_state(mut self, state: StateMap) -> Self {
        self.initial_state = state;
        self
    }

    /// Set one initial state key
    pub fn state_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.initial_state.insert(key.into(), value);
        self
    }

    /// Publish events on an existing bus instead of a private one
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Override the error policy of one node (wins over the config)
    pub fn node_policy(mut self, node_id: impl Into<NodeId>, policy: ErrorPolicy) -> Self {
        self.node_policies.push((node_id.into(), policy));
        self
    }

    /// Callback producing a substitute output for a `custom`-policy node
    pub fn custom_handler<F>(mut self, node_id: impl Into<NodeId>, handler: F) -> Self
    where
        F: Fn(&str, &GraphError, &StateMap) -> std::result::Result<StateMap, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.custom_handlers.push((node_id.into(), Box::new(handler)));
        self
    }

    /// Replace the retry backoff schedule of one node
    pub fn retry_delay_fn<F>(mut self, node_id: impl Into<NodeId>, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.delay_fns.push((node_id.into(), Box::new(delay)));
        self
    }

    /// Merge closure used for `key` under the `merge` output strategy
    pub fn merge_strategy<F>(mut self, key: impl Into<String>, merge: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.reducers.push((key.into(), Arc::new(FnReducer(merge))));
        self
    }

    /// Reducer used for `key` under the `merge` output strategy
    pub fn reducer(mut self, key: impl Into<String>, reducer: impl Reducer + 'static) -> Self {
        self.reducers.push((key.into(), Arc::new(reducer)));
        self
    }

    /// Validate the configuration and assemble the engine.
    ///
    /// # Errors
    ///
    /// [`GraphError::Configuration`] when the config is out of range.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let events = self.events.unwrap_or_default();
        let mut handler = ErrorHandler::new(self.config.default_policy, self.config.retry.clone());

        let policies = self
            .config
            .node_policies
            .iter()
            .map(|(id, policy)| (id.clone(), *policy))
            .chain(self.node_policies);
        for (node_id, policy) in policies {
            if self.graph.node(&node_id).is_none() {
                tracing::warn!(node = %node_id, "Error policy set for unknown node");
            }
            handler.set_policy(node_id, policy);
        }

        for node in self.graph.nodes() {
            let config = node.config();
            if config.retry_count.is_none() && config.retry_delay.is_none() {
                continue;
            }
            let mut retry = self.config.retry.clone();
            if let Some(count) = config.retry_count {
                retry.max_retries = count;
            }
            if let Some(delay) = config.retry_delay {
                retry.base_delay = delay.as_secs_f64();
            }
            handler.set_retry_override(node.id(), retry);
        }

        for (node_id, callback) in self.custom_handlers {
            handler.register_custom_handler(node_id, callback);
        }
        for (node_id, delay) in self.delay_fns {
            handler.register_retry_delay(node_id, delay);
        }

        let handler = handler.with_event_bus(Arc::clone(&events));
        tracing::debug!(
            graph_id = %self.graph.graph_id(),
            max_iterations = self.config.max_iterations,
            default_policy = ?self.config.default_policy,
            "Engine built"
        );

        Ok(Engine {
            graph: self.graph,
            config: self.config,
            initial_state: self.initial_state,
            events,
            handler: Arc::new(handler),
            reducers: self.reducers,
            stats: StatsHandle::new(),
            status: RwLock::new(EngineStatus::Idle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, NodeConfig};

    fn single(node: Node) -> Arc<Graph> {
        let id = node.id().to_string();
        Arc::new(Graph::new("g", vec![node], vec![], id).unwrap())
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let graph = single(Node::from_fn("a", |input| async move { Ok(input) }));
        let err = Engine::builder(graph)
            .config(EngineConfig::default().with_max_iterations(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }

    #[test]
    fn test_node_config_installs_retry_override() {
        let node = Node::from_fn("a", |input| async move { Ok(input) }).with_config(
            NodeConfig::new()
                .with_retry_count(7)
                .with_retry_delay(Duration::from_millis(250)),
        );
        let engine = Engine::builder(single(node))
            .node_policy("a", ErrorPolicy::Skip)
            .build()
            .unwrap();

        let summary = engine.error_summary();
        assert_eq!(summary.retry_overrides, vec!["a".to_string()]);
        assert_eq!(summary.node_policies["a"], ErrorPolicy::Skip);
        assert_eq!(engine.status(), EngineStatus::Idle);
    }

    #[test]
    fn test_builder_policy_wins_over_config() {
        let graph = single(Node::from_fn("a", |input| async move { Ok(input) }));
        let engine = Engine::builder(graph)
            .config(EngineConfig::default().with_node_policy("a", ErrorPolicy::Skip))
            .node_policy("a", ErrorPolicy::FailFast)
            .build()
            .unwrap();
        assert_eq!(engine.error_summary().node_policies["a"], ErrorPolicy::FailFast);
    }

    #[test]
    fn test_run_blocking() {
        let graph = single(Node::from_fn("a", |mut input: StateMap| async move {
            input.insert("ran".into(), Value::Bool(true));
            Ok(input)
        }));
        let engine = Engine::builder(graph).build().unwrap();

        let state = engine.run_blocking().unwrap();
        assert_eq!(state["ran"], Value::Bool(true));
        assert_eq!(engine.status(), EngineStatus::Completed);
        assert_eq!(engine.progress().nodes_executed, 1);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(EngineStatus::Running { superstep: 2 }).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["superstep"], 2);
    }
}
