//! Per-destination message queues between supersteps

use crate::graph::NodeId;
use crate::state::StateMap;
use std::collections::HashMap;

/// Messages addressed to nodes for the next superstep.
///
/// Each destination keeps its messages in arrival order, and destinations
/// are drained in the order they first received a message.
#[derive(Debug, Default)]
pub struct MessageQueues {
    queues: HashMap<NodeId, Vec<StateMap>>,
    arrival: Vec<NodeId>,
}

impl MessageQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `message` for `target`
    pub fn push(&mut self, target: impl Into<NodeId>, message: StateMap) {
        let target = target.into();
        match self.queues.get_mut(&target) {
            Some(queue) => queue.push(message),
            None => {
                self.arrival.push(target.clone());
                self.queues.insert(target, vec![message]);
            }
        }
    }

    /// No node has pending input
    pub fn is_empty(&self) -> bool {
        self.arrival.is_empty()
    }

    /// Nodes with pending input, in first-arrival order
    pub fn active_nodes(&self) -> &[NodeId] {
        &self.arrival
    }

    /// Total number of queued messages
    pub fn pending(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }

    /// Take every queue, leaving the structure empty for the next round
    pub fn drain(&mut self) -> Vec<(NodeId, Vec<StateMap>)> {
        let mut queues = std::mem::take(&mut self.queues);
        std::mem::take(&mut self.arrival)
            .into_iter()
            .filter_map(|id| queues.remove(&id).map(|messages| (id, messages)))
            .collect()
    }
}
