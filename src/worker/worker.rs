//! Worker invocation: role-framed prompt in, structured output back.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::CrewConfig;
use crate::error::WorkerError;
use crate::llm::{CompletionBackend, GenerateRequest, GenerateResponse, ResponseFormat};
use crate::retry::RetryPolicy;
use crate::tools::ToolRegistry;
use crate::worker::spec::{OutputContract, WorkerSpec};

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub backend: Arc<dyn CompletionBackend>,
    pub tools: Arc<ToolRegistry>,
    pub model: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub max_tool_rounds: u32,
}

impl WorkerDeps {
    pub fn new(
        config: &CrewConfig,
        backend: Arc<dyn CompletionBackend>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            backend,
            tools,
            model: config.model.clone(),
            timeout: config.worker_timeout,
            retry: config.retry,
            max_tool_rounds: config.max_tool_rounds,
        }
    }
}

/// A tool request embedded in a worker response.
#[derive(Debug, Clone, Deserialize)]
struct ToolCall {
    #[serde(alias = "tool")]
    name: String,
    #[serde(default, alias = "params", alias = "parameters")]
    arguments: serde_json::Value,
}

/// Binds a [`WorkerSpec`] to the backend and tool registry.
pub struct Worker {
    spec: Arc<WorkerSpec>,
    deps: WorkerDeps,
}

impl Worker {
    pub fn new(spec: Arc<WorkerSpec>, deps: WorkerDeps) -> Self {
        Self { spec, deps }
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Invoke with the worker's own output contract.
    pub async fn invoke(
        &self,
        query: &str,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, WorkerError> {
        let contract = self.spec.output.clone();
        self.invoke_with_contract(query, context, &contract).await
    }

    /// Invoke with a task-specific output contract.
    ///
    /// Tool calls requested by the model are executed through the registry
    /// and their results fed back for up to `max_tool_rounds` follow-ups.
    pub async fn invoke_with_contract(
        &self,
        query: &str,
        context: &serde_json::Value,
        contract: &OutputContract,
    ) -> Result<serde_json::Value, WorkerError> {
        let mut tool_results: Vec<serde_json::Value> = Vec::new();
        let max_rounds = self.deps.max_tool_rounds;

        for round in 0..=max_rounds {
            let round_context = with_tool_results(context, &tool_results);
            let prompt = self.build_prompt(query, &round_context, contract);
            let output = self.generate(prompt).await?;

            let calls = self.tool_calls(&output)?;
            if calls.is_empty() {
                if !contract.shape.matches(&output) {
                    return Err(WorkerError::MalformedOutput {
                        worker: self.spec.name.clone(),
                        reason: format!(
                            "expected {:?} output, got {}",
                            contract.shape,
                            preview(&output.to_string())
                        ),
                    });
                }
                return Ok(output);
            }

            if round == max_rounds {
                return Err(WorkerError::MalformedOutput {
                    worker: self.spec.name.clone(),
                    reason: format!("still requesting tools after {max_rounds} rounds"),
                });
            }

            for call in calls {
                tool_results.push(self.call_tool(call).await?);
            }
        }

        Err(WorkerError::MalformedOutput {
            worker: self.spec.name.clone(),
            reason: "no final output produced".to_string(),
        })
    }

    /// Build the role-framed instruction.
    pub fn build_prompt(
        &self,
        query: &str,
        context: &serde_json::Value,
        contract: &OutputContract,
    ) -> String {
        let mut prompt = format!(
            "Role: {} ({})\nResponsibility: {}\n",
            self.spec.role, self.spec.name, self.spec.responsibility
        );
        if !self.spec.backstory.is_empty() {
            prompt.push_str(&format!("Backstory: {}\n", self.spec.backstory));
        }
        prompt.push_str(&format!("Expected output: {}\n", contract.description));

        let catalogue = self.deps.tools.describe(&self.spec.tools);
        if !catalogue.is_empty() {
            prompt.push_str(
                "Tools: to use a tool, reply only with \
                 {\"tool_calls\": [{\"name\": <tool>, \"arguments\": {...}}]}; \
                 results will appear in Context.tool_results.\n",
            );
            prompt.push_str(&format!(
                "Available tools: {}\n",
                serde_json::Value::Array(catalogue)
            ));
        }

        prompt.push_str(&format!("Context: {}\n", context));
        prompt.push_str(&format!("User Query: {}\n", query));
        prompt.push_str("Provide a detailed response in JSON format:");
        prompt
    }

    /// One backend round-trip: timeout, retry, then parse.
    async fn generate(&self, prompt: String) -> Result<serde_json::Value, WorkerError> {
        let request = GenerateRequest::new(self.deps.model.clone(), prompt)
            .with_format(ResponseFormat::Json);
        let worker = self.spec.name.as_str();
        let timeout = self.deps.timeout;
        let backend = &self.deps.backend;

        tracing::debug!(worker, prompt = %request.prompt, "Invoking worker");

        let response: GenerateResponse = self
            .deps
            .retry
            .run(worker, |e: &WorkerError| e.is_retryable(), |_attempt| {
                let request = request.clone();
                async move {
                    match tokio::time::timeout(timeout, backend.generate(request)).await {
                        Err(_) => Err(WorkerError::BackendUnavailable {
                            worker: worker.to_string(),
                            reason: format!("completion timed out after {timeout:?}"),
                        }),
                        Ok(Err(e)) if e.is_unavailable() => Err(WorkerError::BackendUnavailable {
                            worker: worker.to_string(),
                            reason: e.to_string(),
                        }),
                        Ok(Err(e)) => Err(WorkerError::MalformedOutput {
                            worker: worker.to_string(),
                            reason: e.to_string(),
                        }),
                        Ok(Ok(response)) => Ok(response),
                    }
                }
            })
            .await?;

        extract_json(&response.content).ok_or_else(|| WorkerError::MalformedOutput {
            worker: worker.to_string(),
            reason: format!("response is not valid JSON: {}", preview(&response.content)),
        })
    }

    /// Tool calls carried by `output`; empty for workers without tools.
    fn tool_calls(&self, output: &serde_json::Value) -> Result<Vec<ToolCall>, WorkerError> {
        if self.spec.tools.is_empty() {
            return Ok(Vec::new());
        }
        let Some(raw) = output.get("tool_calls") else {
            return Ok(Vec::new());
        };
        serde_json::from_value(raw.clone()).map_err(|e| WorkerError::MalformedOutput {
            worker: self.spec.name.clone(),
            reason: format!("invalid tool_calls: {e}"),
        })
    }

    async fn call_tool(&self, call: ToolCall) -> Result<serde_json::Value, WorkerError> {
        let fold = |source| WorkerError::Tool {
            worker: self.spec.name.clone(),
            tool: call.name.clone(),
            source,
        };

        if !self.spec.allows_tool(&call.name) {
            return Err(fold(crate::error::ToolError::NotPermitted {
                name: call.name.clone(),
                worker: self.spec.name.clone(),
            }));
        }

        tracing::info!(worker = %self.spec.name, tool = %call.name, "Worker invoking tool");
        let output = self
            .deps
            .tools
            .invoke(&call.name, &call.arguments)
            .await
            .map_err(fold)?;

        Ok(serde_json::json!({
            "tool": call.name,
            "arguments": call.arguments,
            "output": output.result,
            "is_error": output.is_error,
        }))
    }
}

fn with_tool_results(
    context: &serde_json::Value,
    tool_results: &[serde_json::Value],
) -> serde_json::Value {
    if tool_results.is_empty() {
        return context.clone();
    }
    let results = serde_json::Value::Array(tool_results.to_vec());
    match context {
        serde_json::Value::Object(map) => {
            let mut map = map.clone();
            map.insert("tool_results".to_string(), results);
            serde_json::Value::Object(map)
        }
        other => serde_json::json!({ "context": other, "tool_results": results }),
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 200;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(MAX).collect::<String>())
    }
}

/// Extract a JSON value from model output that might carry markdown or
/// surrounding prose.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    // Fenced code block.
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```")
            && let Ok(value) = serde_json::from_str(after[..end].trim())
        {
            return Some(value);
        }
    }

    // Outermost object or array bounds.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
            && end > start
            && let Ok(value) = serde_json::from_str(&trimmed[start..=end])
        {
            return Some(value);
        }
    }

    None
}
