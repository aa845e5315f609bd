//! Worker specifications and the registry they are built into.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Structural shape a worker's output must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    Object,
    Array,
    Any,
}

impl OutputShape {
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

/// Expected output: a human description for the prompt plus a checked shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputContract {
    pub description: String,
    pub shape: OutputShape,
}

impl OutputContract {
    pub fn object(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            shape: OutputShape::Object,
        }
    }

    pub fn any(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            shape: OutputShape::Any,
        }
    }
}

/// A named role with a responsibility and the tools it may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Identifier the classifier refers to (e.g. `DevAgent`).
    pub name: String,
    /// Human role label (e.g. "Kubernetes Developer").
    pub role: String,
    /// What the worker is responsible for.
    pub responsibility: String,
    /// Background framing for the prompt.
    #[serde(default)]
    pub backstory: String,
    /// Default output contract for the worker's tasks.
    pub output: OutputContract,
    /// Tool names this worker may invoke.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl WorkerSpec {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        responsibility: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            responsibility: responsibility.into(),
            backstory: String::new(),
            output: OutputContract::object("A JSON object."),
            tools: Vec::new(),
        }
    }

    pub fn with_backstory(mut self, backstory: impl Into<String>) -> Self {
        self.backstory = backstory.into();
        self
    }

    pub fn with_output(mut self, output: OutputContract) -> Self {
        self.output = output;
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn allows_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }
}

/// Registered workers, in registration order.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    order: Vec<String>,
    workers: HashMap<String, Arc<WorkerSpec>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: WorkerSpec) -> Result<Arc<WorkerSpec>, GraphError> {
        if self.workers.contains_key(&spec.name) {
            return Err(GraphError::DuplicateWorker(spec.name));
        }
        let spec = Arc::new(spec);
        self.order.push(spec.name.clone());
        self.workers.insert(spec.name.clone(), Arc::clone(&spec));
        Ok(spec)
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkerSpec>> {
        self.workers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    /// Names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
