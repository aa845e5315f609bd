//! YAML document validation.
//!
//! Malformed input is a verdict, never an error: the tool answers
//! `{"valid": false, "message": ...}` for broken YAML and unreadable files.

use std::path::Path;
use std::time::Instant;

use serde::Deserialize;

use crate::error::ToolError;
use crate::tools::tool::ToolOutput;

/// Validates YAML content or YAML files.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlValidator;

/// Outcome of a single validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub valid: bool,
    pub message: String,
}

impl YamlValidator {
    pub fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "yaml_content": {
                    "type": "string",
                    "description": "YAML document body to validate"
                },
                "file_path": {
                    "type": "string",
                    "description": "Path to a YAML file to validate"
                }
            },
            "oneOf": [
                { "required": ["yaml_content"] },
                { "required": ["file_path"] }
            ]
        })
    }

    /// Validate a YAML document body. Multi-document streams are accepted.
    pub fn validate_content(content: &str) -> Verdict {
        for document in serde_yaml::Deserializer::from_str(content) {
            if let Err(e) = serde_yaml::Value::deserialize(document) {
                tracing::debug!(error = %e, "YAML validation error");
                return Verdict {
                    valid: false,
                    message: format!("Invalid YAML: {e}"),
                };
            }
        }
        Verdict {
            valid: true,
            message: "YAML is valid.".to_string(),
        }
    }

    /// Validate a YAML file, answering with a human-readable message.
    pub async fn validate_file(path: &Path) -> Verdict {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let verdict = Self::validate_content(&content);
                if verdict.valid {
                    Verdict {
                        valid: true,
                        message: "YAML file is valid.".to_string(),
                    }
                } else {
                    verdict
                }
            }
            Err(e) => Verdict {
                valid: false,
                message: format!("Invalid YAML: could not read {}: {e}", path.display()),
            },
        }
    }

    pub async fn run(&self, _name: &str, params: &serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let verdict = if let Some(content) = params.get("yaml_content").and_then(|v| v.as_str()) {
            Self::validate_content(content)
        } else if let Some(path) = params.get("file_path").and_then(|v| v.as_str()) {
            Self::validate_file(Path::new(path)).await
        } else {
            Verdict {
                valid: false,
                message: "Invalid YAML: no document supplied".to_string(),
            }
        };

        let result = serde_json::json!({
            "valid": verdict.valid,
            "message": verdict.message,
        });
        Ok(ToolOutput::success(result, start.elapsed()))
    }
}
