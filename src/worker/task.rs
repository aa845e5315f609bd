//! Task specifications and the dependency graph they form.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::worker::spec::{OutputContract, WorkerRegistry};

/// A unit of work bound to exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub description: String,
    /// Name of the worker that runs this task.
    pub worker: String,
    pub expected_output: OutputContract,
    #[serde(default)]
    pub requires_checkpoint: bool,
    /// Tasks whose results must have succeeded before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TaskSpec {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        worker: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            worker: worker.into(),
            expected_output: OutputContract::object("A JSON object."),
            requires_checkpoint: false,
            depends_on: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: OutputContract) -> Self {
        self.expected_output = output;
        self
    }

    pub fn with_checkpoint(mut self, required: bool) -> Self {
        self.requires_checkpoint = required;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Tasks in declared order. Dependencies always point backwards, so the
/// declared order is a valid execution order.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<TaskSpec>,
    index: HashMap<String, usize>,
}

impl TaskGraph {
    /// Build and validate a graph against the registered workers.
    pub fn build<I>(tasks: I, workers: &WorkerRegistry) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = TaskSpec>,
    {
        let mut graph = Self::default();
        for task in tasks {
            graph.push(task, workers)?;
        }
        Ok(graph)
    }

    /// Append a task after validating its id, worker and dependencies.
    pub fn push(&mut self, task: TaskSpec, workers: &WorkerRegistry) -> Result<(), GraphError> {
        if self.index.contains_key(&task.id) {
            return Err(GraphError::DuplicateTask(task.id));
        }
        if !workers.contains(&task.worker) {
            return Err(GraphError::UnknownWorker {
                task_id: task.id,
                worker: task.worker,
            });
        }
        if let Some(dep) = task.depends_on.iter().find(|d| !self.index.contains_key(*d)) {
            return Err(GraphError::UnknownDependency {
                task_id: task.id.clone(),
                dependency: dep.clone(),
            });
        }
        self.index.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    /// Sub-graph of the tasks bound to `workers`, in declared order.
    /// Edges to tasks outside the selection are dropped.
    pub fn select(&self, workers: &[String]) -> TaskGraph {
        let keep: HashSet<&str> = self
            .tasks
            .iter()
            .filter(|t| workers.iter().any(|w| *w == t.worker))
            .map(|t| t.id.as_str())
            .collect();

        let mut graph = TaskGraph::default();
        for task in self.tasks.iter().filter(|t| keep.contains(t.id.as_str())) {
            let mut task = task.clone();
            task.depends_on.retain(|d| keep.contains(d.as_str()));
            graph.index.insert(task.id.clone(), graph.tasks.len());
            graph.tasks.push(task);
        }
        graph
    }

    pub fn get(&self, id: &str) -> Option<&TaskSpec> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether `task` depends on `on` directly or through other tasks.
    pub fn depends_transitively(&self, task: &str, on: &str) -> bool {
        let mut stack = vec![task];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            let Some(spec) = self.get(current) else {
                continue;
            };
            for dep in &spec.depends_on {
                if dep == on {
                    return true;
                }
                if seen.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::spec::WorkerSpec;

    fn workers() -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        for name in ["DevAgent", "SecAgent", "OpsAgent"] {
            registry.register(WorkerSpec::new(name, name, "work")).unwrap();
        }
        registry
    }

    fn graph() -> TaskGraph {
        TaskGraph::build(
            vec![
                TaskSpec::new("dev_task", "write manifests", "DevAgent"),
                TaskSpec::new("sec_task", "review", "SecAgent").depends_on(["dev_task"]),
                TaskSpec::new("ops_task", "deploy", "OpsAgent").depends_on(["sec_task"]),
            ],
            &workers(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_unknown_worker() {
        let err = TaskGraph::build(
            vec![TaskSpec::new("helm_task", "chart", "HelmAgent")],
            &workers(),
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::UnknownWorker { .. }));
    }

    #[test]
    fn rejects_forward_or_unknown_dependency() {
        let err = TaskGraph::build(
            vec![
                TaskSpec::new("sec_task", "review", "SecAgent").depends_on(["dev_task"]),
                TaskSpec::new("dev_task", "write", "DevAgent"),
            ],
            &workers(),
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = TaskGraph::build(
            vec![
                TaskSpec::new("dev_task", "a", "DevAgent"),
                TaskSpec::new("dev_task", "b", "DevAgent"),
            ],
            &workers(),
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateTask(_)));
    }

    #[test]
    fn select_keeps_order_and_drops_edges() {
        let selected = graph().select(&["OpsAgent".to_string(), "DevAgent".to_string()]);
        assert_eq!(selected.ids(), vec!["dev_task", "ops_task"]);
        assert!(selected.get("ops_task").unwrap().depends_on.is_empty());
    }

    #[test]
    fn transitive_dependencies() {
        let graph = graph();
        assert!(graph.depends_transitively("ops_task", "dev_task"));
        assert!(!graph.depends_transitively("dev_task", "ops_task"));
    }
}
