//! Completion backend abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Requested response format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// Ask the backend to constrain output to JSON.
    Json,
    /// Free-form text.
    Text,
}

/// A single generate call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub format: ResponseFormat,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            format: ResponseFormat::Json,
        }
    }

    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }
}

/// Raw output of a generate call.
#[derive(Debug, Clone, Default)]
pub struct GenerateResponse {
    /// The model's raw text (JSON text when `ResponseFormat::Json` was requested).
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl GenerateResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// The "generate completion" interface workers are driven through.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Provider label used in errors and logs.
    fn provider_name(&self) -> &str;

    /// Produce a completion for `request`.
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError>;
}
