//! Classifier output handling: which workers take part in a run.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, TaskError};

/// Name of the built-in classifier worker.
pub const CLASSIFIER_WORKER: &str = "ClassifierAgent";

/// Id of the classification task.
pub const CLASSIFY_TASK: &str = "classify_task";

/// Accepted and dropped worker names, in the classifier's order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub workers: Vec<String>,
    pub dropped: Vec<String>,
}

impl Classification {
    /// Filter the classifier's output against `known` worker names.
    ///
    /// Unknown names are dropped with a warning. Unusable output, or an
    /// empty accepted set, is a classification failure.
    pub fn from_output(output: &serde_json::Value, known: &[String]) -> Result<Self, TaskError> {
        let proposed = proposed_names(output).ok_or_else(|| {
            TaskError::new(
                ErrorKind::ClassificationFailed,
                format!("expected a JSON array of worker names, got {output}"),
            )
        })?;

        let mut seen = HashSet::new();
        let mut classification = Classification::default();
        for name in proposed {
            if !seen.insert(name.clone()) {
                continue;
            }
            if known.iter().any(|k| *k == name) {
                classification.workers.push(name);
            } else {
                tracing::warn!(worker = %name, "Classifier proposed unknown worker, dropping");
                classification.dropped.push(name);
            }
        }

        if classification.workers.is_empty() {
            return Err(TaskError::new(
                ErrorKind::ClassificationFailed,
                format!(
                    "no registered worker selected (proposed: {:?})",
                    classification.dropped
                ),
            ));
        }
        Ok(classification)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "workers": self.workers, "dropped": self.dropped })
    }

    /// Read back a payload produced by [`Classification::to_value`].
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

/// A bare string array, or an object holding exactly one string array.
fn proposed_names(output: &serde_json::Value) -> Option<Vec<String>> {
    match output {
        serde_json::Value::Array(items) => string_items(items),
        serde_json::Value::Object(map) => {
            let mut arrays = map.values().filter_map(|v| v.as_array());
            let only = arrays.next()?;
            if arrays.next().is_some() {
                return None;
            }
            string_items(only)
        }
        _ => None,
    }
}

fn string_items(items: &[serde_json::Value]) -> Option<Vec<String>> {
    items
        .iter()
        .map(|v| v.as_str().map(|s| s.trim().to_string()))
        .collect()
}
