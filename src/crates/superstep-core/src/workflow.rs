//! Thin builder for assembling and running a graph in one place
//!
//! ```rust
//! use superstep_core::config::EngineConfig;
//! use superstep_core::workflow::Workflow;
//! use serde_json::json;
//!
//! # tokio_test_block_on(async {
//! let mut workflow = Workflow::new("counter");
//! workflow
//!     .initial_value("count", json!(0))
//!     .add_node("increment", |mut input| async move {
//!         let count = input["count"].as_i64().unwrap_or(0);
//!         input.insert("count".into(), json!(count + 1));
//!         Ok(input)
//!     })
//!     .add_node("double", |mut input| async move {
//!         let count = input["count"].as_i64().unwrap_or(0);
//!         input.insert("count".into(), json!(count * 2));
//!         Ok(input)
//!     })
//!     .add_edge("increment", "double");
//!
//! let result = workflow.run(EngineConfig::default()).await;
//! assert!(result.success);
//! assert_eq!(result.final_state["count"], json!(2));
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineBuilder, ExecutionStats};
use crate::error::{BoxError, Result};
use crate::graph::{Edge, EdgeCondition, Graph, Node, NodeConfig, NodeId};
use crate::state::StateMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Outcome of [`Workflow::run`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Final state, or the last committed state when the run failed
    pub final_state: StateMap,
    pub stats: ExecutionStats,
    pub success: bool,
    pub error: Option<String>,
    /// Node blamed for the failure, when there is one
    pub failed_node: Option<NodeId>,
}

/// Named collection of nodes and edges with a start node
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    start: Option<NodeId>,
    initial_state: StateMap,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            start: None,
            initial_state: StateMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the initial state
    pub fn initial_state(&mut self, state: StateMap) -> &mut Self {
        self.initial_state = state;
        self
    }

    /// Set one initial state key
    pub fn initial_value(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.initial_state.insert(key.into(), value);
        self
    }

    /// Add a prebuilt node. The first node added becomes the start node
    /// unless [`set_start_node`](Self::set_start_node) says otherwise.
    pub fn push_node(&mut self, node: Node) -> &mut Self {
        if self.start.is_none() {
            self.start = Some(node.id().to_string());
        }
        self.nodes.push(node);
        self
    }

    /// Add a node backed by an async closure
    pub fn add_node<F, Fut>(&mut self, id: impl Into<NodeId>, func: F) -> &mut Self
    where
        F: Fn(StateMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<StateMap, BoxError>> + Send + 'static,
    {
        self.push_node(Node::from_fn(id, func))
    }

    /// Add a node backed by an async closure with explicit settings
    pub fn add_node_with_config<F, Fut>(&mut self, id: impl Into<NodeId>, config: NodeConfig, func: F) -> &mut Self
    where
        F: Fn(StateMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<StateMap, BoxError>> + Send + 'static,
    {
        self.push_node(Node::from_fn(id, func).with_config(config))
    }

    /// Add a node backed by a blocking closure
    pub fn add_blocking_node<F>(&mut self, id: impl Into<NodeId>, func: F) -> &mut Self
    where
        F: Fn(StateMap) -> std::result::Result<StateMap, BoxError> + Send + Sync + 'static,
    {
        self.push_node(Node::blocking(id, func))
    }

    pub fn add_edge(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) -> &mut Self {
        self.edges.push(Edge::new(source, target));
        self
    }

    pub fn add_conditional_edge(
        &mut self,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        condition: EdgeCondition,
    ) -> &mut Self {
        self.edges.push(Edge::conditional(source, target, condition));
        self
    }

    /// Connect `ids` in sequence with unconditional edges
    pub fn chain<I, S>(&mut self, ids: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let ids: Vec<NodeId> = ids.into_iter().map(Into::into).collect();
        for pair in ids.windows(2) {
            self.edges.push(Edge::new(pair[0].clone(), pair[1].clone()));
        }
        self
    }

    pub fn set_start_node(&mut self, id: impl Into<NodeId>) -> &mut Self {
        self.start = Some(id.into());
        self
    }

    /// Validate and assemble the graph
    pub fn build_graph(&self) -> Result<Graph> {
        Graph::new(
            self.name.clone(),
            self.nodes.clone(),
            self.edges.clone(),
            self.start.clone().unwrap_or_default(),
        )
    }

    /// Engine builder preloaded with this workflow's graph, initial state
    /// and `config`, for installing callbacks before running
    pub fn engine_builder(&self, config: EngineConfig) -> Result<EngineBuilder> {
        Ok(Engine::builder(Arc::new(self.build_graph()?))
            .config(config)
            .initial_state(self.initial_state.clone()))
    }

    /// Build and run. Never fails; problems are reported in the result.
    pub async fn run(&self, config: EngineConfig) -> WorkflowResult {
        match self.engine_builder(config).and_then(EngineBuilder::build) {
            Ok(engine) => Self::run_engine(&engine).await,
            Err(error) => {
                tracing::error!(workflow = %self.name, error = %error, "Workflow could not be built");
                WorkflowResult {
                    final_state: self.initial_state.clone(),
                    stats: ExecutionStats::default(),
                    success: false,
                    error: Some(error.to_string()),
                    failed_node: None,
                }
            }
        }
    }

    /// Run a prepared engine and wrap its outcome
    pub async fn run_engine(engine: &Engine) -> WorkflowResult {
        match engine.run().await {
            Ok(final_state) => WorkflowResult {
                final_state,
                stats: engine.stats(),
                success: true,
                error: None,
                failed_node: None,
            },
            Err(fatal) => WorkflowResult {
                error: Some(fatal.to_string()),
                failed_node: fatal.node_id,
                final_state: fatal.state,
                stats: engine.stats(),
                success: false,
            },
        }
    }
}
