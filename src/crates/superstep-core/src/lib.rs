//! # superstep-core - Bulk-synchronous graph execution
//!
//! Runs graphs of opaque work units ("nodes") in Pregel-style supersteps.
//! In each round every node with pending input runs concurrently against
//! the same state snapshot, writes its output to a shared state store and
//! forwards the output along its matching outgoing edges for the next
//! round. Fan-out, fan-in and loops fall out of that model directly.
//!
//! ## Core pieces
//!
//! | Module | Role |
//! |--------|------|
//! | [`graph`] | Validated nodes and edges with precomputed adjacency |
//! | [`state`] | Thread-safe state store with merge strategies and reducers |
//! | [`error_handler`] | Per-node failure policies: fail-fast, retry, skip, custom |
//! | [`events`] | Lifecycle events with fault-isolated handlers |
//! | [`engine`] | The superstep scheduler |
//! | [`config`] | Serializable engine options (YAML, TOML, JSON) |
//! | [`workflow`] | Builder that assembles and runs a graph in one place |
//!
//! ## Example
//!
//! ```rust,no_run
//! use superstep_core::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let fetch = Node::from_fn("fetch", |mut input| async move {
//!     input.insert("documents".into(), json!(["a", "b"]));
//!     Ok(input)
//! });
//! let summarize = Node::from_fn("summarize", |input| async move {
//!     let count = input["documents"].as_array().map_or(0, Vec::len);
//!     let mut output = StateMap::new();
//!     output.insert("summary".into(), json!(format!("{count} documents")));
//!     Ok(output)
//! });
//!
//! let graph = Graph::new(
//!     "research",
//!     vec![fetch, summarize],
//!     vec![Edge::new("fetch", "summarize")],
//!     "fetch",
//! )?;
//!
//! let engine = Engine::builder(Arc::new(graph))
//!     .config(EngineConfig::default().with_default_policy(ErrorPolicy::Retry))
//!     .build()?;
//! let state = engine.run().await?;
//! assert_eq!(state["summary"], json!("2 documents"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! The crate emits `tracing` events and spans (`workflow` per run, `node` per
//! activation) but never installs a subscriber; that is left to the binary.

pub mod config;
pub mod engine;
pub mod error;
pub mod error_handler;
pub mod events;
pub mod graph;
pub mod retry;
pub mod state;
pub mod workflow;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EngineStatus, ExecutionStats, Progress, StatsHandle};
pub use error::{BoxError, FatalError, GraphError, Result};
pub use error_handler::{ErrorHandler, ErrorPolicy, Recovery};
pub use events::{Event, EventBus, EventPayload, EventType, HandlerId};
pub use graph::{Edge, EdgeCondition, Graph, Node, NodeConfig, NodeExecutor, NodeId};
pub use retry::RetryPolicy;
pub use state::{
    AppendReducer, MergeReducer, OverwriteReducer, Reducer, StateMap, StateStore, StateView,
    SumReducer, UpdateStrategy,
};
pub use workflow::{Workflow, WorkflowResult};

/// Commonly used types
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Engine, EngineStatus};
    pub use crate::error::{BoxError, FatalError, GraphError};
    pub use crate::error_handler::ErrorPolicy;
    pub use crate::events::{EventBus, EventType};
    pub use crate::graph::{Edge, EdgeCondition, Graph, Node, NodeConfig};
    pub use crate::state::{StateMap, UpdateStrategy};
    pub use crate::workflow::Workflow;
}
