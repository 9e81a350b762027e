//! Nodes and the executor capability they wrap

use crate::error::BoxError;
use crate::state::StateMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use super::NodeId;

/// Future returned by [`NodeExecutor::execute`]
pub type ExecutorFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<StateMap, BoxError>> + Send + 'a>>;

/// Node executor trait - the unit of work behind every node.
///
/// The engine treats executors as opaque: it hands over the aggregated input
/// record and expects an output record or an error. Executors that block the
/// thread should be wrapped in [`BlockingExecutor`] so they run on the
/// blocking pool instead of stalling the runtime.
pub trait NodeExecutor: Send + Sync {
    /// Execute the node with the given input.
    fn execute(&self, input: StateMap) -> ExecutorFuture<'_>;
}

/// Executor backed by an async closure
pub struct FnExecutor<F> {
    func: F,
}

impl<F> FnExecutor<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F, Fut> NodeExecutor for FnExecutor<F>
where
    F: Fn(StateMap) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<StateMap, BoxError>> + Send + 'static,
{
    fn execute(&self, input: StateMap) -> ExecutorFuture<'_> {
        Box::pin((self.func)(input))
    }
}

type BlockingFn = dyn Fn(StateMap) -> std::result::Result<StateMap, BoxError> + Send + Sync;

/// Executor backed by a synchronous closure, run on tokio's blocking pool
pub struct BlockingExecutor {
    func: Arc<BlockingFn>,
}

impl BlockingExecutor {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(StateMap) -> std::result::Result<StateMap, BoxError> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
        }
    }
}

impl NodeExecutor for BlockingExecutor {
    fn execute(&self, input: StateMap) -> ExecutorFuture<'_> {
        let func = Arc::clone(&self.func);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || func(input))
                .await
                .map_err(|join_err| -> BoxError {
                    format!("blocking executor aborted: {join_err}").into()
                })?
        })
    }
}

/// Per-node execution settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Wall-clock limit on a single executor call
    pub timeout: Option<Duration>,
    /// Overrides the handler's `max_retries` for this node
    pub retry_count: Option<u32>,
    /// Overrides the handler's `base_delay` for this node
    pub retry_delay: Option<Duration>,
    /// Free-form annotations, ignored by the engine
    pub metadata: StateMap,
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A vertex of the graph: an id, an executor and its settings.
///
/// Cloning a node is cheap; the executor is shared.
#[derive(Clone)]
pub struct Node {
    id: NodeId,
    executor: Arc<dyn NodeExecutor>,
    config: NodeConfig,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("executor", &"<executor>")
            .field("config", &self.config)
            .finish()
    }
}

impl Node {
    /// Create a node from any executor
    pub fn new(id: impl Into<NodeId>, executor: Arc<dyn NodeExecutor>) -> Self {
        Self {
            id: id.into(),
            executor,
            config: NodeConfig::default(),
        }
    }

    /// Create a node from an async closure
    ///
    /// ```rust
    /// use superstep_core::graph::Node;
    ///
    /// let node = Node::from_fn("echo", |input| async move { Ok(input) });
    /// assert_eq!(node.id(), "echo");
    /// ```
    pub fn from_fn<F, Fut>(id: impl Into<NodeId>, func: F) -> Self
    where
        F: Fn(StateMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<StateMap, BoxError>> + Send + 'static,
    {
        Self::new(id, Arc::new(FnExecutor::new(func)))
    }

    /// Create a node from a synchronous closure that may block
    pub fn blocking<F>(id: impl Into<NodeId>, func: F) -> Self
    where
        F: Fn(StateMap) -> std::result::Result<StateMap, BoxError> + Send + Sync + 'static,
    {
        Self::new(id, Arc::new(BlockingExecutor::new(func)))
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<dyn NodeExecutor> {
        &self.executor
    }
}
