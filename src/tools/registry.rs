//! Tool registry: name lookup, input-schema validation and bounded dispatch.

use std::collections::HashMap;
use std::time::Duration;

use jsonschema::Validator;

use crate::config::CrewConfig;
use crate::error::ToolError;
use crate::retry::RetryPolicy;
use crate::tools::tool::{ToolOutput, ToolSpec};

struct RegisteredTool {
    spec: ToolSpec,
    validator: Validator,
}

/// Registry of available tools.
///
/// Populated once at startup, then shared immutably behind an `Arc`.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            tools: HashMap::new(),
            timeout,
            retry,
        }
    }

    /// Registry holding the built-in YAML validator and kubectl tools.
    pub fn with_builtin_tools(config: &CrewConfig) -> Result<Self, ToolError> {
        let mut registry = Self::new(config.tool_timeout, config.retry);
        registry.register(ToolSpec::yaml_validator())?;
        registry.register(ToolSpec::kubectl(config.kubectl_binary.clone()))?;
        Ok(registry)
    }

    /// Register a tool. The first registration of a name wins.
    pub fn register(&mut self, spec: ToolSpec) -> Result<(), ToolError> {
        if self.tools.contains_key(&spec.name) {
            tracing::warn!(tool = %spec.name, "Rejected duplicate tool registration");
            return Ok(());
        }
        let validator =
            jsonschema::validator_for(&spec.input_schema).map_err(|e| ToolError::InvalidSchema {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;
        tracing::debug!(tool = %spec.name, "Registered tool");
        self.tools
            .insert(spec.name.clone(), RegisteredTool { spec, validator });
        Ok(())
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|t| &t.spec)
    }

    /// All tool names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Prompt-ready descriptions of the named tools (unknown names skipped).
    pub fn describe(&self, names: &[String]) -> Vec<serde_json::Value> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                serde_json::json!({
                    "name": tool.spec.name,
                    "description": tool.spec.description,
                    "parameters": tool.spec.input_schema,
                })
            })
            .collect()
    }

    /// Validate `params` against the tool's input schema.
    pub fn validate(&self, name: &str, params: &serde_json::Value) -> Result<(), ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        if tool.validator.is_valid(params) {
            return Ok(());
        }
        let reason = tool
            .validator
            .iter_errors(params)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(ToolError::InvalidInput {
            name: name.to_string(),
            reason,
        })
    }

    /// Invoke a tool: lookup, validate, then dispatch under the tool timeout.
    /// Timeouts are retried per the registry's retry policy.
    pub async fn invoke(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        self.validate(name, params)?;
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;

        let timeout = self.timeout;
        self.retry
            .run(
                name,
                |e: &ToolError| matches!(e, ToolError::Timeout { .. }),
                |attempt| async move {
                    tracing::debug!(tool = name, attempt, "Invoking tool");
                    tokio::time::timeout(timeout, tool.spec.kind.run(name, params))
                        .await
                        .map_err(|_| ToolError::Timeout {
                            name: name.to_string(),
                            timeout,
                        })?
                },
            )
            .await
    }
}
