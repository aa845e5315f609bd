//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Default Ollama endpoint.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Default model served by the local backend.
pub const DEFAULT_MODEL: &str = "llama3.2:3b";

/// How the scheduler walks the task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// Tasks run in declared order, dependencies permitting.
    Sequential,
    /// The manager worker picks the next task and may delegate new ones.
    Hierarchical,
}

impl FromStr for ProcessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "hierarchical" => Ok(Self::Hierarchical),
            other => Err(format!("unknown process mode '{other}'")),
        }
    }
}

/// Crew configuration, passed explicitly into the scheduler and workers.
#[derive(Debug, Clone)]
pub struct CrewConfig {
    /// Model identifier sent to the completion backend.
    pub model: String,
    /// Completion backend base URL.
    pub base_url: String,
    /// Execution mode.
    pub process: ProcessMode,
    /// Maximum number of concurrently active workers.
    pub max_concurrent_workers: usize,
    /// Timeout for a single completion call.
    pub worker_timeout: Duration,
    /// Timeout for a single tool invocation.
    pub tool_timeout: Duration,
    /// Retry policy for timed-out or unreachable calls.
    pub retry: RetryPolicy,
    /// Maximum tool round-trips a worker may make per invocation.
    pub max_tool_rounds: u32,
    /// Rejections tolerated before a checkpointed task fails.
    pub max_checkpoint_rounds: u32,
    /// Manager decisions requested before falling back to declared order.
    pub max_manager_steps: u32,
    /// How long a checkpoint waits for a decision (None = indefinitely).
    pub checkpoint_timeout: Option<Duration>,
    /// Binary driven by the command tool.
    pub kubectl_binary: String,
}

impl Default for CrewConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            process: ProcessMode::Hierarchical,
            max_concurrent_workers: 1,
            worker_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            max_tool_rounds: 3,
            max_checkpoint_rounds: 3,
            max_manager_steps: 16,
            checkpoint_timeout: None,
            kubectl_binary: "kubectl".to_string(),
        }
    }
}

impl CrewConfig {
    /// Load configuration from `CREW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(model) = lookup("CREW_MODEL").or_else(|| lookup("OPENAI_MODEL_NAME")) {
            config.model = normalize_model(&model);
        }
        if let Some(url) = lookup("CREW_BASE_URL") {
            config.base_url = url;
        }
        if let Some(mode) = lookup("CREW_PROCESS") {
            config.process = mode.parse().map_err(|message| ConfigError::InvalidValue {
                key: "CREW_PROCESS".to_string(),
                message,
            })?;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "CREW_MAX_CONCURRENCY")? {
            if n == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "CREW_MAX_CONCURRENCY".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.max_concurrent_workers = n;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CREW_WORKER_TIMEOUT_SECS")? {
            config.worker_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CREW_TOOL_TIMEOUT_SECS")? {
            config.tool_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "CREW_MAX_RETRIES")? {
            config.retry.max_retries = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CREW_RETRY_BACKOFF_MS")? {
            config.retry.base_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CREW_CHECKPOINT_TIMEOUT_SECS")? {
            config.checkpoint_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(bin) = lookup("CREW_KUBECTL") {
            config.kubectl_binary = bin;
        }

        Ok(config)
    }
}

/// Strip a provider routing prefix such as `ollama/llama3.2:3b`.
fn normalize_model(model: &str) -> String {
    model
        .trim()
        .strip_prefix("ollama/")
        .unwrap_or(model.trim())
        .to_string()
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
    }
}
