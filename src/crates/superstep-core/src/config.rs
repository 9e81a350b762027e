//! Engine configuration
//!
//! [`EngineConfig`] holds every serializable engine option. It can be built in
//! code or loaded from YAML, TOML or JSON; missing fields take their
//! defaults.
//!
//! ```yaml
//! max_iterations: 50
//! timeout_secs: 30
//! default_policy: retry
//! node_policies:
//!   enrich: skip
//!   publish: fail_fast
//! retry:
//!   max_retries: 2
//!   base_delay: 0.5
//! output_strategy: merge
//! ```
//!
//! Options that are closures (custom error handlers, retry delay functions,
//! merge functions) are installed through
//! [`EngineBuilder`](crate::engine::EngineBuilder) instead.

use crate::error::{GraphError, Result};
use crate::error_handler::ErrorPolicy;
use crate::graph::NodeId;
use crate::retry::RetryPolicy;
use crate::state::UpdateStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Serializable engine options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Superstep cap; reaching it with pending input is fatal
    pub max_iterations: usize,

    /// Run deadline in seconds, checked between supersteps
    pub timeout_secs: Option<f64>,

    /// Policy for nodes without an override
    pub default_policy: ErrorPolicy,

    /// Per-node policy overrides
    pub node_policies: HashMap<NodeId, ErrorPolicy>,

    /// Backoff used by the `retry` policy
    pub retry: RetryPolicy,

    /// Accepted for compatibility; durable checkpointing is not performed
    pub checkpoint_interval: Option<usize>,

    /// Strategy used to write node outputs into the state
    pub output_strategy: UpdateStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            timeout_secs: None,
            default_policy: ErrorPolicy::Retry,
            node_policies: HashMap::new(),
            retry: RetryPolicy::default(),
            checkpoint_interval: None,
            output_strategy: UpdateStrategy::Overwrite,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_default_policy(mut self, policy: ErrorPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_node_policy(mut self, node_id: impl Into<NodeId>, policy: ErrorPolicy) -> Self {
        self.node_policies.insert(node_id.into(), policy);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_output_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.output_strategy = strategy;
        self
    }

    /// Run deadline, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Check option ranges.
    ///
    /// # Errors
    ///
    /// [`GraphError::Configuration`] describing the first invalid option.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(GraphError::Configuration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if let Some(timeout) = self.timeout_secs {
            if timeout <= 0.0 || Duration::try_from_secs_f64(timeout).is_err() {
                return Err(GraphError::Configuration(format!(
                    "timeout_secs must be a positive duration, got {timeout}"
                )));
            }
        }

        let retry = &self.retry;
        for (name, value) in [("base_delay", retry.base_delay), ("max_delay", retry.max_delay)] {
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(GraphError::Configuration(format!(
                    "retry.{name} must be a non-negative duration, got {value}"
                )));
            }
        }
        if !retry.backoff_factor.is_finite() || retry.backoff_factor < 1.0 {
            return Err(GraphError::Configuration(format!(
                "retry.backoff_factor must be at least 1.0, got {}",
                retry.backoff_factor
            )));
        }
        if self.checkpoint_interval == Some(0) {
            return Err(GraphError::Configuration(
                "checkpoint_interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_yaml_str(input: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        Ok(toml::from_str(input)?)
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    /// Load and validate a config file, choosing the format by extension
    /// (`.yaml`/`.yml`, `.toml`, `.json`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::parse_for_path(path, &content)
    }

    /// Async variant of [`from_file`](Self::from_file)
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse_for_path(path, &content)
    }

    fn parse_for_path(path: &Path, content: &str) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        let config = match extension.as_deref() {
            Some("yaml") | Some("yml") => Self::from_yaml_str(content)?,
            Some("toml") => Self::from_toml_str(content)?,
            Some("json") => Self::from_json_str(content)?,
            _ => {
                return Err(GraphError::Configuration(format!(
                    "unsupported config format: {}",
                    path.display()
                )))
            }
        };

        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded engine configuration");
        Ok(config)
    }
}
