//! Directed edges and their routing conditions

use crate::error::BoxError;
use crate::state::{StateMap, StateView};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::NodeId;

type Predicate = dyn Fn(&StateMap, &StateView) -> std::result::Result<bool, BoxError> + Send + Sync;

/// Decides whether a node's output is forwarded along an edge.
///
/// Conditions are evaluated after the source node's output has been written
/// to the state, so `state` already reflects that write.
#[derive(Clone, Default)]
pub enum EdgeCondition {
    /// Always forward
    #[default]
    Always,
    /// Forward when `key` equals `value`
    ///
    /// The output is consulted first; if it does not carry `key`, or carries
    /// it as `null`, the state is checked instead.
    KeyEquals {
        key: String,
        value: Value,
    },
    /// Arbitrary predicate over `(output, state)`
    Custom(Arc<Predicate>),
}

impl fmt::Debug for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::KeyEquals { key, value } => f
                .debug_struct("KeyEquals")
                .field("key", key)
                .field("value", value)
                .finish(),
            Self::Custom(_) => write!(f, "Custom(<predicate>)"),
        }
    }
}

impl EdgeCondition {
    /// Shorthand for [`EdgeCondition::KeyEquals`]
    pub fn key_equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::KeyEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Wrap a predicate closure
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&StateMap, &StateView) -> std::result::Result<bool, BoxError> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    /// Evaluate the condition against a node output and the current state
    pub fn evaluate(&self, output: &StateMap, state: &StateView) -> std::result::Result<bool, BoxError> {
        match self {
            Self::Always => Ok(true),
            Self::KeyEquals { key, value } => {
                // A null output value counts as absent.
                let actual = output
                    .get(key)
                    .filter(|v| !v.is_null())
                    .or_else(|| state.get(key));
                Ok(actual == Some(value))
            }
            Self::Custom(predicate) => predicate(output, state),
        }
    }
}

/// Directed connection between two nodes
#[derive(Debug, Clone)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub condition: EdgeCondition,
    pub metadata: StateMap,
}

impl Edge {
    /// Unconditional edge
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: EdgeCondition::Always,
            metadata: StateMap::new(),
        }
    }

    /// Edge guarded by `condition`
    pub fn conditional(
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            condition,
            ..Self::new(source, target)
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the edge is [`EdgeCondition::Always`]
    pub fn is_unconditional(&self) -> bool {
        matches!(self.condition, EdgeCondition::Always)
    }
}
