//! Execution statistics

use super::EngineStatus;
use crate::graph::NodeId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Counters collected during a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Supersteps that ran to completion
    pub total_supersteps: usize,
    /// Activations whose executor returned output, counted once however
    /// many attempts they took
    pub total_nodes_executed: usize,
    /// Activations whose output was substituted by `skip` or `custom`
    pub nodes_recovered: usize,
    /// Messages enqueued for a later superstep
    pub messages_sent: usize,
    /// Wall-clock time of each node's most recent activation
    pub node_execution_times: HashMap<NodeId, Duration>,
}

impl ExecutionStats {
    /// Elapsed time between start and end, once both are known
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.start_time?, self.end_time?);
        (end - start).to_std().ok()
    }
}

/// Progress report for a running or finished engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub status: EngineStatus,
    pub supersteps_completed: usize,
    pub nodes_executed: usize,
    pub total_nodes: usize,
    pub messages_sent: usize,
}

/// Shared, read-mostly view of [`ExecutionStats`].
///
/// Only the scheduler writes; any clone can read while a run is in flight.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    inner: Arc<RwLock<ExecutionStats>>,
}

impl StatsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current statistics
    pub fn snapshot(&self) -> ExecutionStats {
        self.inner.read().clone()
    }

    pub(crate) fn begin(&self) {
        *self.inner.write() = ExecutionStats {
            start_time: Some(Utc::now()),
            ..ExecutionStats::default()
        };
    }

    pub(crate) fn finish(&self) {
        self.inner.write().end_time = Some(Utc::now());
    }

    pub(crate) fn superstep_completed(&self, messages_sent: usize) {
        let mut stats = self.inner.write();
        stats.total_supersteps += 1;
        stats.messages_sent += messages_sent;
    }

    pub(crate) fn node_finished(&self, node_id: &str, elapsed: Duration, recovered: bool) {
        let mut stats = self.inner.write();
        if recovered {
            stats.nodes_recovered += 1;
        } else {
            stats.total_nodes_executed += 1;
        }
        stats.node_execution_times.insert(node_id.to_string(), elapsed);
    }

    pub(crate) fn progress(&self, status: EngineStatus, total_nodes: usize) -> Progress {
        let stats = self.inner.read();
        Progress {
            status,
            supersteps_completed: stats.total_supersteps,
            nodes_executed: stats.total_nodes_executed + stats.nodes_recovered,
            total_nodes,
            messages_sent: stats.messages_sent,
        }
    }
}
