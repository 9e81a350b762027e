//! Fan-out/fan-in example
//!
//! A planner fans out to three workers that run in the same superstep. Their
//! outputs are merged with a sum reducer, and an aggregator runs once all of
//! them have reported. One worker is flaky and recovers through retries.
//!
//! Run with `RUST_LOG=superstep_core=debug` to see the scheduler's logs.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use superstep_core::prelude::*;
use superstep_core::state::SumReducer;
use superstep_core::RetryPolicy;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Fan-out / Fan-in Example ===\n");

    let flaky_calls = Arc::new(AtomicU32::new(0));
    let calls = flaky_calls.clone();

    let mut nodes = vec![Node::from_fn("plan", |mut input: StateMap| async move {
        input.insert("plan".into(), json!(["alpha", "beta", "gamma"]));
        Ok(input)
    })];
    for (name, score) in [("alpha", 3), ("beta", 5)] {
        nodes.push(Node::from_fn(name, move |_input| async move {
            let mut output = StateMap::new();
            output.insert("score".into(), json!(score));
            output.insert(format!("{name}_done"), json!(true));
            Ok(output)
        }));
    }
    nodes.push(Node::from_fn("gamma", move |_input| {
        let calls = calls.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err("upstream not ready".into());
            }
            let mut output = StateMap::new();
            output.insert("score".into(), json!(7));
            output.insert("gamma_done".into(), json!(true));
            Ok(output)
        }
    }));
    nodes.push(Node::from_fn("aggregate", |input: StateMap| async move {
        let done = ["alpha", "beta", "gamma"]
            .iter()
            .filter(|name| input.get(&format!("{name}_done")) == Some(&Value::Bool(true)))
            .count();
        let mut output = StateMap::new();
        output.insert("workers_done".into(), json!(done));
        Ok(output)
    }));

    let mut edges = Vec::new();
    for worker in ["alpha", "beta", "gamma"] {
        edges.push(Edge::new("plan", worker));
        edges.push(Edge::new(worker, "aggregate"));
    }

    let graph = Graph::new("fan_out_fan_in", nodes, edges, "plan")?;
    let config = EngineConfig::default()
        .with_output_strategy(UpdateStrategy::Merge)
        .with_retry(RetryPolicy::new(2).with_base_delay(0.1));

    let engine = Engine::builder(Arc::new(graph))
        .config(config)
        .reducer("score", SumReducer)
        .state_value("score", json!(0))
        .build()?;

    engine.events().on(EventType::SuperstepCompleted, |event| {
        println!("  {:?}", event.payload);
        Ok(())
    });

    let state = engine.run().await?;
    let stats = engine.stats();

    println!("\nFinal score: {}", state["score"]);
    println!("Workers done: {}", state["workers_done"]);
    println!(
        "Supersteps: {}, nodes executed: {}, messages: {}",
        stats.total_supersteps, stats.total_nodes_executed, stats.messages_sent
    );
    println!("Gamma attempts: {}", flaky_calls.load(Ordering::SeqCst));

    Ok(())
}
