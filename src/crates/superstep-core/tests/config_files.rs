//! Loading engine configuration from disk and running workflows with it

use serde_json::json;
use std::path::PathBuf;
use superstep_core::prelude::*;
use superstep_core::retry::RetryPolicy;
use tempfile::TempDir;

/// Write `content` to `name` inside `dir`
fn config_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_from_file_picks_format_by_extension() {
    let dir = TempDir::new().unwrap();
    let yaml = config_file(&dir, "engine.yml", "max_iterations: 7\ndefault_policy: skip\n");
    let toml = config_file(&dir, "engine.toml", "max_iterations = 8\noutput_strategy = \"merge\"\n");
    let json = config_file(&dir, "engine.json", r#"{"max_iterations": 9, "timeout_secs": 1.5}"#);

    let from_yaml = EngineConfig::from_file(&yaml).unwrap();
    assert_eq!(from_yaml.max_iterations, 7);
    assert_eq!(from_yaml.default_policy, ErrorPolicy::Skip);

    let from_toml = EngineConfig::from_file(&toml).unwrap();
    assert_eq!(from_toml.max_iterations, 8);
    assert_eq!(from_toml.output_strategy, UpdateStrategy::Merge);

    let from_json = EngineConfig::from_file(&json).unwrap();
    assert_eq!(from_json.max_iterations, 9);
    assert_eq!(from_json.timeout_secs, Some(1.5));
}

#[test]
fn test_from_file_rejects_bad_input() {
    let dir = TempDir::new().unwrap();

    let unknown = config_file(&dir, "engine.ini", "max_iterations=1");
    assert!(matches!(
        EngineConfig::from_file(&unknown),
        Err(GraphError::Configuration(_))
    ));

    let invalid = config_file(&dir, "zero.yaml", "max_iterations: 0\n");
    assert!(matches!(
        EngineConfig::from_file(&invalid),
        Err(GraphError::Configuration(_))
    ));

    let far_deadline = config_file(&dir, "far.json", r#"{"timeout_secs": 1e30}"#);
    assert!(matches!(
        EngineConfig::from_file(&far_deadline),
        Err(GraphError::Configuration(_))
    ));

    let malformed = config_file(&dir, "broken.yaml", "max_iterations: [oops\n");
    assert!(matches!(EngineConfig::from_file(&malformed), Err(GraphError::Yaml(_))));

    assert!(matches!(
        EngineConfig::from_file(dir.path().join("missing.yaml")),
        Err(GraphError::Io(_))
    ));
}

#[test]
fn test_engine_rejects_unrepresentable_timeout() {
    let graph = Graph::new(
        "far",
        vec![Node::from_fn("n", |input| async move { Ok(input) })],
        vec![],
        "n",
    )
    .unwrap();
    let mut config = EngineConfig::default();
    config.timeout_secs = Some(1e30);

    let err = Engine::builder(std::sync::Arc::new(graph))
        .config(config)
        .build()
        .unwrap_err();
    assert!(matches!(err, GraphError::Configuration(_)));
}

#[tokio::test]
async fn test_loaded_policies_drive_a_workflow() {
    let dir = TempDir::new().unwrap();
    let path = config_file(
        &dir,
        "engine.yaml",
        "default_policy: fail_fast\nnode_policies:\n  flaky: skip\n",
    );
    let config = EngineConfig::load(&path).await.unwrap();

    let mut workflow = Workflow::new("configured");
    workflow
        .initial_value("seed", json!(1))
        .add_node("flaky", |_input| async move { Err("unavailable".into()) })
        .add_node("report", |mut input| async move {
            input.insert("reported".into(), json!(true));
            Ok(input)
        })
        .add_edge("flaky", "report");

    let result = workflow.run(config).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.final_state["reported"], json!(true));
    assert_eq!(result.final_state["seed"], json!(1));
    assert_eq!(result.stats.nodes_recovered, 1);
    assert_eq!(result.stats.total_nodes_executed, 1);
}

#[tokio::test]
async fn test_workflow_result_carries_failure() {
    let mut workflow = Workflow::new("exhausted");
    workflow.add_node("down", |_input| async move { Err("still down".into()) });

    let config = EngineConfig::default().with_retry(RetryPolicy::new(2).with_base_delay(0.0));
    let result = workflow.run(config).await;

    assert!(!result.success);
    assert_eq!(result.failed_node.as_deref(), Some("down"));
    let error = result.error.unwrap();
    assert!(error.contains("still down"), "{error}");
}
