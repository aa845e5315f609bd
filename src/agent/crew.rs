//! Run entry point: classify, schedule, aggregate.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::approval::CheckpointGate;
use crate::agent::classifier::Classification;
use crate::agent::kubernetes;
use crate::config::CrewConfig;
use crate::error::{ErrorKind, GraphError, Result, TaskError};
use crate::llm::{self, CompletionBackend};
use crate::tools::ToolRegistry;
use crate::worker::scheduler::{Flow, RejectedDelegation, Roster, RunScope, Scheduler};
use crate::worker::spec::{WorkerRegistry, WorkerSpec};
use crate::worker::state::{TaskEvent, TaskResult, TaskStatus};
use crate::worker::task::{TaskGraph, TaskSpec};
use crate::worker::worker::WorkerDeps;

/// Workers and tasks registered at startup.
#[derive(Debug, Clone)]
pub struct CrewDefinition {
    /// Routing worker; also the manager in hierarchical mode.
    pub classifier: WorkerSpec,
    pub classify_task: TaskSpec,
    pub workers: Vec<WorkerSpec>,
    /// Tasks in declared order.
    pub tasks: Vec<TaskSpec>,
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Success,
    PartialFailure,
    RunAborted,
    RunCancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct FinalResult {
    pub run_id: Uuid,
    pub query: String,
    pub status: RunStatus,
    /// Workers the classifier selected, in its order.
    pub selected_workers: Vec<String>,
    /// Unknown names the classifier proposed.
    pub dropped_workers: Vec<String>,
    pub classifier: TaskResult,
    /// One result per selected (or delegated) task.
    pub results: BTreeMap<String, TaskResult>,
    pub rejected_delegations: Vec<RejectedDelegation>,
    /// Context Store contents at the end of the run.
    pub context: serde_json::Value,
    /// Every status change of the run, in the order applied.
    pub events: Vec<TaskEvent>,
    /// Why the run stopped early, if it did.
    pub abort: Option<TaskError>,
}

impl FinalResult {
    /// Every task that did not succeed, with its error.
    pub fn failures(&self) -> Vec<(&str, &TaskError)> {
        std::iter::once(&self.classifier)
            .chain(self.results.values())
            .filter(|r| matches!(r.status, TaskStatus::Failed | TaskStatus::Cancelled))
            .filter_map(|r| r.error.as_ref().map(|e| (r.task_id.as_str(), e)))
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// A configured crew, ready to run queries.
pub struct Crew {
    config: CrewConfig,
    roster: Arc<Roster>,
    classifier: String,
    classify_task: TaskSpec,
    graph: TaskGraph,
    gate: Arc<CheckpointGate>,
}

impl Crew {
    pub fn new(
        definition: CrewDefinition,
        config: CrewConfig,
        backend: Arc<dyn CompletionBackend>,
        tools: Arc<ToolRegistry>,
    ) -> Result<Self> {
        let classifier = definition.classifier.name.clone();
        let mut registry = WorkerRegistry::new();
        registry.register(definition.classifier)?;
        for worker in definition.workers {
            registry.register(worker)?;
        }

        let classify_task = definition.classify_task;
        if !registry.contains(&classify_task.worker) {
            return Err(GraphError::UnknownWorker {
                task_id: classify_task.id,
                worker: classify_task.worker,
            }
            .into());
        }
        let graph = TaskGraph::build(definition.tasks, &registry)?;

        let deps = WorkerDeps::new(&config, backend, tools);
        Ok(Self {
            config,
            roster: Arc::new(Roster::new(registry, deps)),
            classifier,
            classify_task,
            graph,
            gate: Arc::new(CheckpointGate::new()),
        })
    }

    /// The built-in Kubernetes crew against the configured Ollama backend.
    pub fn kubernetes(config: CrewConfig) -> Result<Self> {
        let backend = llm::create_backend(&config);
        let tools = Arc::new(ToolRegistry::with_builtin_tools(&config)?);
        Self::new(kubernetes::definition(), config, backend, tools)
    }

    pub fn config(&self) -> &CrewConfig {
        &self.config
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Gate through which checkpoint requests are reviewed.
    pub fn checkpoints(&self) -> &Arc<CheckpointGate> {
        &self.gate
    }

    /// Workers the classifier may select.
    pub fn selectable_workers(&self) -> Vec<String> {
        self.roster
            .registry
            .names()
            .iter()
            .filter(|name| **name != self.classifier)
            .cloned()
            .collect()
    }

    /// Run a query to completion.
    pub async fn run(&self, query: &str) -> FinalResult {
        self.run_with_cancel(query, CancellationToken::new()).await
    }

    /// Run a query, stopping early when `cancel` fires.
    pub async fn run_with_cancel(&self, query: &str, cancel: CancellationToken) -> FinalResult {
        let run_id = Uuid::new_v4();
        tracing::info!(%run_id, query, "Starting run");

        let scope = RunScope {
            run_id,
            query: query.to_string(),
            cancel,
        };
        let mut scheduler = Scheduler::new(
            scope,
            self.config.clone(),
            Arc::clone(&self.roster),
            Arc::clone(&self.gate),
        );
        if let Some(manager) = self.roster.worker(&self.classifier) {
            scheduler = scheduler.with_manager(Arc::clone(manager));
        }

        let known = self.selectable_workers();
        let check = move |payload: serde_json::Value| {
            Classification::from_output(&payload, &known).map(|c| c.to_value())
        };
        let classifier_status = scheduler.run_task(&self.classify_task, &check).await;
        let classifier = scheduler
            .state()
            .get(&self.classify_task.id)
            .await
            .unwrap_or_else(|| TaskResult::new(&self.classify_task.id, &self.classifier));

        let mut result = FinalResult {
            run_id,
            query: query.to_string(),
            status: RunStatus::Success,
            selected_workers: Vec::new(),
            dropped_workers: Vec::new(),
            classifier: classifier.clone(),
            results: BTreeMap::new(),
            rejected_delegations: Vec::new(),
            context: serde_json::Value::Null,
            events: Vec::new(),
            abort: None,
        };

        let classification = classifier
            .payload
            .as_ref()
            .and_then(Classification::from_payload);
        let classification = match (classifier_status, classification) {
            (TaskStatus::Succeeded, Some(c)) => c,
            (TaskStatus::Cancelled, _) => {
                result.status = RunStatus::RunCancelled;
                result.context = scheduler.context().snapshot().await;
                result.events = scheduler.state().events().await;
                return result;
            }
            _ => {
                tracing::warn!(%run_id, "Classification failed, aborting run");
                result.status = RunStatus::RunAborted;
                result.abort = Some(match &classifier.error {
                    Some(e) if e.kind == ErrorKind::ClassificationFailed => e.clone(),
                    Some(e) => TaskError::new(ErrorKind::ClassificationFailed, e.to_string()),
                    None => TaskError::new(
                        ErrorKind::ClassificationFailed,
                        "classifier produced no decision",
                    ),
                });
                result.context = scheduler.context().snapshot().await;
                result.events = scheduler.state().events().await;
                return result;
            }
        };

        tracing::info!(
            %run_id,
            selected = ?classification.workers,
            dropped = ?classification.dropped,
            "Classification accepted"
        );
        result.selected_workers = classification.workers.clone();
        result.dropped_workers = classification.dropped;

        let outcome = scheduler.run(self.graph.select(&classification.workers)).await;
        let mut all = scheduler.state().results().await;
        result.results = outcome
            .graph
            .ids()
            .into_iter()
            .filter_map(|id| all.remove(&id).map(|r| (id, r)))
            .collect();
        result.rejected_delegations = outcome.rejected_delegations;
        result.context = scheduler.context().snapshot().await;
        result.events = scheduler.state().events().await;

        result.status = match outcome.flow {
            Flow::Cancelled => RunStatus::RunCancelled,
            Flow::Aborted(error) => {
                result.abort = Some(error);
                RunStatus::RunAborted
            }
            Flow::Completed => {
                if result
                    .results
                    .values()
                    .all(|r| r.status == TaskStatus::Succeeded)
                {
                    RunStatus::Success
                } else {
                    RunStatus::PartialFailure
                }
            }
        };

        tracing::info!(%run_id, status = %result.status, tasks = result.results.len(), "Run finished");
        result
    }
}
