//! Error types and error handling for graph operations
//!
//! This module defines every error that can occur while constructing a graph,
//! loading configuration, mutating state, or running supersteps. All errors
//! implement `std::error::Error` via the `thiserror` crate.
//!
//! # Error Hierarchy
//!
//! ```text
//! GraphError
//! ├── Validation           - Malformed graph (bad ids, dangling edges)
//! ├── Configuration        - Malformed engine configuration
//! ├── NodeExecution        - A node body failed (or a custom handler raised)
//! ├── ConditionEvaluation  - An edge predicate returned an error
//! ├── RetryExhausted       - Retry policy gave up on a node
//! ├── DuplicateKey         - RAISE update hit an existing key
//! ├── Reducer              - A registered merge function failed
//! ├── IterationLimit       - Superstep cap reached with work pending
//! ├── Timeout              - Run deadline passed
//! ├── Serialization        - JSON errors
//! ├── Yaml / Toml          - Configuration parsing errors
//! └── Io                   - File access errors
//! ```
//!
//! # Fatal vs recoverable
//!
//! Node failures are first offered to the
//! [`ErrorHandler`](crate::error_handler::ErrorHandler). Only when the handler
//! escalates does the scheduler abort the run; it then returns a
//! [`FatalError`] that carries the [`GraphError`], the failing node, the
//! superstep number, and the last fully committed state.
//!
//! ```rust
//! use superstep_core::error::GraphError;
//!
//! fn describe(err: &GraphError) -> String {
//!     match err {
//!         GraphError::Validation(msg) => format!("fix the graph: {msg}"),
//!         GraphError::RetryExhausted { node, attempts, .. } => {
//!             format!("{node} gave up after {attempts} attempts")
//!         }
//!         other => other.to_string(),
//!     }
//! }
//! ```

use crate::graph::NodeId;
use crate::state::StateMap;
use thiserror::Error;

/// Boxed error type returned by node bodies, predicates and callbacks.
///
/// Node executors may fail with any error; the engine only needs its message
/// and never inspects the concrete type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Convenience result type using [`GraphError`]
pub type Result<T> = std::result::Result<T, GraphError>;

/// Comprehensive error type for all graph operations
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure validation failed
    ///
    /// Raised by [`Graph::new`](crate::graph::Graph::new) when an invariant is
    /// violated. The message always names the offending id.
    #[error("Graph validation failed: {0}")]
    Validation(String),

    /// Engine configuration is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Node execution failed with context
    ///
    /// Wraps whatever error the node body produced. Also used when a
    /// `Custom` error callback itself fails.
    #[error("Node '{node}' execution failed: {error}")]
    NodeExecution {
        /// Id of the node that failed
        node: NodeId,
        /// Error message from node execution
        error: String,
    },

    /// An edge predicate returned an error
    #[error("Condition on edge '{source_node}' -> '{target}' failed: {error}")]
    ConditionEvaluation {
        /// Source node of the edge
        source_node: NodeId,
        /// Target node of the edge
        target: NodeId,
        /// Error message from the predicate
        error: String,
    },

    /// The retry policy gave up on a node
    #[error("Node '{node}' failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Id of the node that failed
        node: NodeId,
        /// Number of executor invocations made
        attempts: u32,
        /// Message of the final failure
        last_error: String,
    },

    /// A `Raise` update found the key already present
    ///
    /// The whole update call is rejected; nothing from it is applied.
    #[error("Key '{key}' already exists in state")]
    DuplicateKey {
        /// The conflicting key
        key: String,
    },

    /// A registered reducer could not merge two values
    #[error("Reducer for key '{key}' failed: {error}")]
    Reducer {
        /// Key being merged
        key: String,
        /// Reducer error message
        error: String,
    },

    /// The superstep cap was reached while nodes still had pending input
    #[error("Maximum iterations ({max_iterations}) exceeded")]
    IterationLimit {
        /// Configured cap
        max_iterations: usize,
    },

    /// The run deadline passed
    ///
    /// The deadline is cooperative: it is checked between supersteps, so the
    /// round that was in flight when it expired always completes.
    #[error("Workflow deadline exceeded after {elapsed_ms}ms")]
    Timeout {
        /// Wall-clock time spent when the deadline was detected
        elapsed_ms: u64,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraphError {
    /// Create a node execution error with context
    ///
    /// ```rust
    /// use superstep_core::error::GraphError;
    ///
    /// let err = GraphError::node_execution("llm_call", "API timeout");
    /// assert_eq!(err.to_string(), "Node 'llm_call' execution failed: API timeout");
    /// ```
    pub fn node_execution(node: impl Into<NodeId>, error: impl ToString) -> Self {
        Self::NodeExecution {
            node: node.into(),
            error: error.to_string(),
        }
    }

    /// Create a condition evaluation error for the edge `source -> target`
    pub fn condition(
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        error: impl ToString,
    ) -> Self {
        Self::ConditionEvaluation {
            source_node: source.into(),
            target: target.into(),
            error: error.to_string(),
        }
    }

    /// Short, stable name of the variant, used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
            Self::NodeExecution { .. } => "node_execution",
            Self::ConditionEvaluation { .. } => "condition_evaluation",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::DuplicateKey { .. } => "duplicate_key",
            Self::Reducer { .. } => "reducer",
            Self::IterationLimit { .. } => "iteration_limit",
            Self::Timeout { .. } => "timeout",
            Self::Serialization(_) => "serialization",
            Self::Yaml(_) => "yaml",
            Self::Toml(_) => "toml",
            Self::Io(_) => "io",
        }
    }
}

/// Outcome of a run that ended in an unrecoverable failure.
///
/// `state` is the state as committed at the end of the last fully completed
/// superstep: writes from the failing round are rolled back.
#[derive(Error, Debug)]
#[error("Workflow failed at superstep {superstep}{}: {error}", node_id.as_ref().map(|n| format!(" (node '{}')", n)).unwrap_or_default())]
pub struct FatalError {
    /// The escalated error
    #[source]
    pub error: GraphError,
    /// Node that caused the failure, if any
    pub node_id: Option<NodeId>,
    /// Superstep in which the failure was detected
    pub superstep: usize,
    /// Last fully committed state
    pub state: StateMap,
}

impl FatalError {
    pub(crate) fn new(
        error: GraphError,
        node_id: Option<NodeId>,
        superstep: usize,
        state: StateMap,
    ) -> Self {
        Self {
            error,
            node_id,
            superstep,
            state,
        }
    }
}
