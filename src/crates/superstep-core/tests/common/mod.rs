//! Shared helpers for integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use superstep_core::events::{EventBus, EventPayload};
use superstep_core::graph::Node;
use superstep_core::state::StateMap;

/// Build a `StateMap` from a `json!` object literal
pub fn map(value: Value) -> StateMap {
    value.as_object().cloned().expect("object literal")
}

/// Node that returns its input unchanged
pub fn identity(id: &str) -> Node {
    Node::from_fn(id, |input| async move { Ok(input) })
}

/// Node that ignores its input and returns `output`
pub fn writes(id: &str, output: Value) -> Node {
    let output = map(output);
    Node::from_fn(id, move |_input| {
        let output = output.clone();
        async move { Ok(output) }
    })
}

/// Record every payload published on `bus`
pub fn record_events(bus: &EventBus) -> Arc<Mutex<Vec<EventPayload>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.on_any(move |event| {
        sink.lock().push(event.payload.clone());
        Ok(())
    });
    seen
}

/// Active node lists of every `SuperstepStarted` event, in order
pub fn rounds(events: &[EventPayload]) -> Vec<Vec<String>> {
    events
        .iter()
        .filter_map(|payload| match payload {
            EventPayload::SuperstepStarted { active_nodes, .. } => {
                let mut nodes = active_nodes.clone();
                nodes.sort();
                Some(nodes)
            }
            _ => None,
        })
        .collect()
}
