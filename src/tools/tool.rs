//! Tool definitions.

use std::time::Duration;

use serde::Serialize;

use crate::error::ToolError;
use crate::tools::builtin::command::CommandTool;
use crate::tools::builtin::yaml::YamlValidator;

/// Output of a tool invocation.
///
/// `is_error` marks failures the tool reports in-band (a non-zero exit, an
/// invalid document) as opposed to registry-level [`ToolError`]s.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    pub is_error: bool,
    #[serde(skip)]
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self {
            result,
            is_error: false,
            duration,
        }
    }

    pub fn failure(result: serde_json::Value, duration: Duration) -> Self {
        Self {
            result,
            is_error: true,
            duration,
        }
    }
}

/// The closed set of capabilities a tool can wrap.
#[derive(Debug, Clone)]
pub enum ToolKind {
    /// In-process YAML document validation.
    YamlValidator(YamlValidator),
    /// External binary invocation.
    Command(CommandTool),
}

impl ToolKind {
    /// Dispatch to the wrapped capability.
    pub async fn run(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        match self {
            Self::YamlValidator(tool) => tool.run(name, params).await,
            Self::Command(tool) => tool.run(name, params).await,
        }
    }
}

/// A named, schema-described tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub kind: ToolKind,
}

impl ToolSpec {
    /// The YAML validation tool.
    pub fn yaml_validator() -> Self {
        Self {
            name: "yaml_validator".to_string(),
            description: "Validates Kubernetes YAML documents for syntax and structure. \
                          Pass the document body as yaml_content, or a path as file_path."
                .to_string(),
            input_schema: YamlValidator::schema(),
            kind: ToolKind::YamlValidator(YamlValidator),
        }
    }

    /// The kubectl command tool driving `binary`.
    pub fn kubectl(binary: impl Into<String>) -> Self {
        let tool = CommandTool::new(binary);
        Self {
            name: "kubectl".to_string(),
            description: "Executes kubectl commands to manage Kubernetes resources \
                          (e.g. 'get pods -n default')."
                .to_string(),
            input_schema: CommandTool::schema(),
            kind: ToolKind::Command(tool),
        }
    }
}

/// Extract a required string parameter.
pub fn require_str<'a>(
    tool: &str,
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidInput {
            name: tool.to_string(),
            reason: format!("missing '{key}' parameter"),
        })
}
