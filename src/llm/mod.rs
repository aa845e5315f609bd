//! LLM integration.
//!
//! Workers reach the model through the [`CompletionBackend`] trait; the only
//! concrete backend is a local Ollama server.

pub mod ollama;
pub mod provider;

pub use ollama::OllamaBackend;
pub use provider::*;

use std::sync::Arc;

use crate::config::CrewConfig;

/// Create the completion backend described by `config`.
pub fn create_backend(config: &CrewConfig) -> Arc<dyn CompletionBackend> {
    tracing::info!(
        base_url = %config.base_url,
        model = %config.model,
        "Using Ollama backend"
    );
    Arc::new(OllamaBackend::new(config.base_url.clone()))
}
