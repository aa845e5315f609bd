//! Commands the hierarchical manager may issue.

use serde::{Deserialize, Serialize};

use crate::worker::spec::OutputContract;
use crate::worker::state::TaskStatus;
use crate::worker::task::TaskSpec;

/// One manager decision. Anything else the manager says is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ManagerCommand {
    /// Run an existing task next.
    RunTask { task_id: String },
    /// Add a new task bound to a registered worker.
    DelegateTask { task: DelegatedTask },
    /// Nothing more to decide; remaining tasks run in declared order.
    Finish,
}

impl ManagerCommand {
    pub fn parse(value: &serde_json::Value) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|e| format!("invalid manager command: {e}"))
    }
}

/// A task synthesized by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedTask {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    #[serde(alias = "agent")]
    pub worker: String,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub requires_checkpoint: bool,
}

impl DelegatedTask {
    /// Convert into a task spec, using `fallback_id` when the manager gave none.
    pub fn into_spec(self, fallback_id: String) -> TaskSpec {
        let output = self
            .expected_output
            .map(OutputContract::object)
            .unwrap_or_else(|| OutputContract::object("A JSON object."));
        TaskSpec::new(self.id.unwrap_or(fallback_id), self.description, self.worker)
            .with_output(output)
            .with_checkpoint(self.requires_checkpoint)
            .depends_on(self.depends_on)
    }
}

/// Contract for a manager reply.
pub fn command_contract() -> OutputContract {
    OutputContract::object(
        "Exactly one command object: {\"command\": \"run_task\", \"task_id\": <id>}, \
         {\"command\": \"delegate_task\", \"task\": {\"id\", \"description\", \"worker\", \
         \"depends_on\"}} or {\"command\": \"finish\"}.",
    )
}

/// Query asking the manager for its next decision.
pub fn decision_query(
    user_query: &str,
    tasks: &[(TaskSpec, TaskStatus)],
    workers: &[String],
) -> String {
    let board: Vec<serde_json::Value> = tasks
        .iter()
        .map(|(task, status)| {
            serde_json::json!({
                "id": task.id,
                "worker": task.worker,
                "description": task.description,
                "depends_on": task.depends_on,
                "status": status,
            })
        })
        .collect();

    format!(
        "You are managing the crew working on: {user_query}\n\
         Tasks: {}\n\
         Registered workers: {}\n\
         Choose the next pending task whose dependencies have succeeded, \
         delegate a new task to a registered worker, or finish.",
        serde_json::Value::Array(board),
        workers.join(", ")
    )
}
