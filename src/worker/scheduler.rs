//! Task scheduler: drives a run's task graph to completion.
//!
//! Two modes share one task driver:
//! - sequential: dataflow over the declared order, at most
//!   `max_concurrent_workers` tasks in flight
//! - hierarchical: the manager worker picks the next task or delegates new
//!   ones; bad or missing decisions fall back to declared order
//!
//! Every await point of the loop races the run's cancellation token.
//! Dropping an in-flight task never leaves a half-written context: a task's
//! payload is committed in one batch before the task is marked succeeded.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::approval::{CheckpointDecision, CheckpointGate, CheckpointRequest};
use crate::agent::manager::{self, DelegatedTask, ManagerCommand};
use crate::config::{CrewConfig, ProcessMode};
use crate::error::{ErrorKind, TaskError};
use crate::worker::context::ContextStore;
use crate::worker::spec::WorkerRegistry;
use crate::worker::state::{RunState, TaskStatus};
use crate::worker::task::{TaskGraph, TaskSpec};
use crate::worker::worker::{Worker, WorkerDeps};

/// Post-processing applied to a worker payload before checkpoint and commit.
pub type PayloadCheck =
    dyn Fn(serde_json::Value) -> Result<serde_json::Value, TaskError> + Send + Sync;

/// Payload check that accepts anything.
pub fn accept_payload(payload: serde_json::Value) -> Result<serde_json::Value, TaskError> {
    Ok(payload)
}

/// Context Store key holding checkpoint feedback for a task.
pub fn feedback_key(task_id: &str) -> String {
    format!("feedback:{task_id}")
}

/// Registered workers together with their runnable counterparts.
pub struct Roster {
    pub registry: WorkerRegistry,
    workers: HashMap<String, Arc<Worker>>,
}

impl Roster {
    pub fn new(registry: WorkerRegistry, deps: WorkerDeps) -> Self {
        let workers = registry
            .names()
            .iter()
            .filter_map(|name| registry.get(name))
            .map(|spec| {
                let name = spec.name.clone();
                (name, Arc::new(Worker::new(spec, deps.clone())))
            })
            .collect();
        Self { registry, workers }
    }

    pub fn worker(&self, name: &str) -> Option<&Arc<Worker>> {
        self.workers.get(name)
    }
}

/// A manager delegation the scheduler refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedDelegation {
    pub task_id: Option<String>,
    pub worker: String,
    pub error: TaskError,
}

/// How a scheduling pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Every task reached a terminal state.
    Completed,
    /// A load-bearing task failed; the remainder was cancelled.
    Aborted(TaskError),
    /// The cancellation token fired.
    Cancelled,
}

/// What a run's scheduling produced besides the task results.
#[derive(Debug)]
pub struct ScheduleOutcome {
    pub flow: Flow,
    /// Final graph, including tasks delegated by the manager.
    pub graph: TaskGraph,
    pub rejected_delegations: Vec<RejectedDelegation>,
}

/// Identity of one run.
#[derive(Debug, Clone)]
pub struct RunScope {
    pub run_id: Uuid,
    pub query: String,
    pub cancel: CancellationToken,
}

/// Drives the tasks of one run. Owns the run's context store and results.
pub struct Scheduler {
    scope: RunScope,
    config: CrewConfig,
    roster: Arc<Roster>,
    gate: Arc<CheckpointGate>,
    manager: Option<Arc<Worker>>,
    context: Arc<ContextStore>,
    state: Arc<RunState>,
}

impl Scheduler {
    pub fn new(
        scope: RunScope,
        config: CrewConfig,
        roster: Arc<Roster>,
        gate: Arc<CheckpointGate>,
    ) -> Self {
        let context = Arc::new(ContextStore::for_query(&scope.query));
        Self {
            scope,
            config,
            roster,
            gate,
            manager: None,
            context,
            state: Arc::new(RunState::new()),
        }
    }

    /// Worker consulted for decisions in hierarchical mode.
    pub fn with_manager(mut self, manager: Arc<Worker>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    /// Drive a single task to a terminal state.
    pub async fn run_task(&self, task: &TaskSpec, check: &PayloadCheck) -> TaskStatus {
        self.state.insert(&task.id, &task.worker).await;
        match self.cancellable(self.execute_task(task, check)).await {
            Some(status) => status,
            None => {
                self.cancel_unterminated().await;
                TaskStatus::Cancelled
            }
        }
    }

    /// Drive every task of `graph` to a terminal state.
    pub async fn run(&self, graph: TaskGraph) -> ScheduleOutcome {
        let mut graph = graph;
        let mut rejected = Vec::new();
        for task in graph.tasks() {
            self.state.insert(&task.id, &task.worker).await;
        }

        tracing::info!(
            run_id = %self.scope.run_id,
            tasks = graph.len(),
            process = ?self.config.process,
            "Scheduling tasks"
        );

        let flow = match (self.config.process, self.manager.clone()) {
            (ProcessMode::Hierarchical, Some(manager)) => {
                self.run_hierarchical(&manager, &mut graph, &mut rejected)
                    .await
            }
            _ => self.run_dataflow(&graph).await,
        };

        if flow == Flow::Cancelled {
            self.cancel_unterminated().await;
        }

        ScheduleOutcome {
            flow,
            graph,
            rejected_delegations: rejected,
        }
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.scope.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// Declared-order dataflow with bounded concurrency.
    async fn run_dataflow(&self, graph: &TaskGraph) -> Flow {
        let limit = self.config.max_concurrent_workers.max(1);
        let mut launched: HashSet<String> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            self.cascade_dependency_failures(graph).await;

            for task in graph.tasks() {
                if in_flight.len() >= limit {
                    break;
                }
                if launched.contains(&task.id) || !self.is_ready(task).await {
                    continue;
                }
                launched.insert(task.id.clone());
                in_flight.push(async move {
                    let status = self.execute_task(task, &accept_payload).await;
                    (task.id.clone(), status)
                });
            }

            if in_flight.is_empty() {
                return Flow::Completed;
            }

            let (task_id, status) = tokio::select! {
                biased;
                _ = self.scope.cancel.cancelled() => return Flow::Cancelled,
                Some(done) = in_flight.next() => done,
            };

            if status == TaskStatus::Failed
                && let Some(error) = self.check_load_bearing(graph, &task_id).await
            {
                return Flow::Aborted(error);
            }
        }
    }

    /// Manager-directed execution, one task at a time.
    async fn run_hierarchical(
        &self,
        manager: &Worker,
        graph: &mut TaskGraph,
        rejected: &mut Vec<RejectedDelegation>,
    ) -> Flow {
        let mut steps = 0u32;
        let mut delegated = 0usize;

        loop {
            self.cascade_dependency_failures(graph).await;
            let ready = self.ready_tasks(graph).await;
            if ready.is_empty() {
                return Flow::Completed;
            }

            if steps >= self.config.max_manager_steps {
                tracing::info!(
                    run_id = %self.scope.run_id,
                    steps,
                    "Manager step budget spent, draining in declared order"
                );
                return self.run_dataflow(graph).await;
            }
            steps += 1;

            let Some(command) = self.cancellable(self.next_command(manager, graph)).await else {
                return Flow::Cancelled;
            };

            let next = match command {
                Some(ManagerCommand::RunTask { task_id }) if ready.contains(&task_id) => task_id,
                Some(ManagerCommand::RunTask { task_id }) => {
                    tracing::warn!(
                        task_id = %task_id,
                        "Manager chose a task that is not ready, using declared order"
                    );
                    ready[0].clone()
                }
                Some(ManagerCommand::DelegateTask { task }) => {
                    delegated += 1;
                    match self.delegate(graph, task, delegated).await {
                        Ok(task_id) => {
                            tracing::info!(task_id = %task_id, "Manager delegated task");
                        }
                        Err(rejection) => {
                            tracing::warn!(
                                worker = %rejection.worker,
                                error = %rejection.error,
                                "Rejected delegation"
                            );
                            rejected.push(rejection);
                        }
                    }
                    continue;
                }
                Some(ManagerCommand::Finish) => {
                    tracing::info!(run_id = %self.scope.run_id, "Manager finished, draining remaining tasks");
                    return self.run_dataflow(graph).await;
                }
                None => ready[0].clone(),
            };

            let Some(task) = graph.get(&next).cloned() else {
                continue;
            };
            let Some(status) = self
                .cancellable(self.execute_task(&task, &accept_payload))
                .await
            else {
                return Flow::Cancelled;
            };

            if status == TaskStatus::Failed
                && let Some(error) = self.check_load_bearing(graph, &next).await
            {
                return Flow::Aborted(error);
            }
        }
    }

    /// Ask the manager for one decision. `None` means no usable answer.
    async fn next_command(&self, manager: &Worker, graph: &TaskGraph) -> Option<ManagerCommand> {
        let mut board = Vec::with_capacity(graph.len());
        for task in graph.tasks() {
            let status = self
                .state
                .status(&task.id)
                .await
                .unwrap_or(TaskStatus::Pending);
            board.push((task.clone(), status));
        }

        let query = manager::decision_query(&self.scope.query, &board, self.roster.registry.names());
        let context = self.context.snapshot().await;
        match manager
            .invoke_with_contract(&query, &context, &manager::command_contract())
            .await
        {
            Ok(reply) => match ManagerCommand::parse(&reply) {
                Ok(command) => Some(command),
                Err(reason) => {
                    tracing::warn!(%reason, "Unusable manager reply, using declared order");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Manager invocation failed, using declared order");
                None
            }
        }
    }

    async fn delegate(
        &self,
        graph: &mut TaskGraph,
        task: DelegatedTask,
        n: usize,
    ) -> Result<String, RejectedDelegation> {
        let requested_id = task.id.clone();
        let worker = task.worker.clone();
        let spec = task.into_spec(format!("delegated_task_{n}"));
        let task_id = spec.id.clone();
        let reject = |message: String| RejectedDelegation {
            task_id: requested_id.clone(),
            worker: worker.clone(),
            error: TaskError::new(ErrorKind::UnknownDelegate, message),
        };

        // Ids outside the graph (the classify task) are taken too.
        if self.state.status(&task_id).await.is_some() {
            return Err(reject(format!("task id {task_id} is already in use")));
        }
        graph
            .push(spec, &self.roster.registry)
            .map_err(|e| reject(e.to_string()))?;
        self.state.insert(&task_id, &worker).await;
        Ok(task_id)
    }

    /// Run one task: invoke, check, checkpoint, commit.
    async fn execute_task(&self, task: &TaskSpec, check: &PayloadCheck) -> TaskStatus {
        let task_id = task.id.as_str();
        let Some(worker) = self.roster.worker(&task.worker) else {
            self.fail(
                task_id,
                TaskError::new(
                    ErrorKind::UnknownDelegate,
                    format!("worker {} is not registered", task.worker),
                ),
            )
            .await;
            return TaskStatus::Failed;
        };

        let mut rejections = 0u32;
        loop {
            if !self.state.transition(task_id, TaskStatus::Running, None).await {
                return self
                    .state
                    .status(task_id)
                    .await
                    .unwrap_or(TaskStatus::Failed);
            }
            self.state.update(task_id, |r| r.attempts += 1).await;
            tracing::info!(
                run_id = %self.scope.run_id,
                task_id,
                worker = %task.worker,
                "Task started"
            );

            let context = self.task_context(task).await;
            let query = format!("{}\nRequest: {}", task.description, self.scope.query);
            let outcome = worker
                .invoke_with_contract(&query, &context, &task.expected_output)
                .await
                .map_err(|e| TaskError::from(&e))
                .and_then(check);

            let payload = match outcome {
                Ok(payload) => payload,
                Err(error) => {
                    tracing::warn!(task_id, error = %error, "Task failed");
                    self.fail(task_id, error).await;
                    return TaskStatus::Failed;
                }
            };

            if task.requires_checkpoint {
                match self.checkpoint(task, rejections + 1, &payload).await {
                    Ok(CheckpointDecision::Approve { feedback }) => {
                        let reason = feedback.unwrap_or_else(|| "checkpoint approved".to_string());
                        self.state
                            .transition(task_id, TaskStatus::Running, Some(reason))
                            .await;
                    }
                    Ok(CheckpointDecision::Reject { feedback }) => {
                        rejections += 1;
                        self.context
                            .append(feedback_key(task_id), serde_json::Value::String(feedback.clone()))
                            .await;
                        if rejections >= self.config.max_checkpoint_rounds {
                            self.fail(
                                task_id,
                                TaskError::new(
                                    ErrorKind::CheckpointRejected,
                                    format!("rejected {rejections} times, last feedback: {feedback}"),
                                ),
                            )
                            .await;
                            return TaskStatus::Failed;
                        }
                        tracing::info!(task_id, rejections, "Checkpoint rejected, re-running task");
                        self.state
                            .transition(
                                task_id,
                                TaskStatus::Pending,
                                Some(format!("checkpoint rejected: {feedback}")),
                            )
                            .await;
                        continue;
                    }
                    Err(e) => {
                        self.fail(task_id, TaskError::from(&e)).await;
                        return TaskStatus::Failed;
                    }
                }
            }

            self.context
                .commit([(task.id.clone(), payload.clone())])
                .await;
            self.state
                .update(task_id, |r| {
                    r.payload = Some(payload);
                    r.error = None;
                    r.transition_to(TaskStatus::Succeeded, None)
                })
                .await;
            tracing::info!(run_id = %self.scope.run_id, task_id, "Task succeeded");
            return TaskStatus::Succeeded;
        }
    }

    async fn checkpoint(
        &self,
        task: &TaskSpec,
        round: u32,
        payload: &serde_json::Value,
    ) -> Result<CheckpointDecision, crate::error::CheckpointError> {
        self.state
            .update(&task.id, |r| {
                r.payload = Some(payload.clone());
                r.transition_to(
                    TaskStatus::AwaitingCheckpoint,
                    Some(format!("checkpoint round {round}")),
                )
            })
            .await;

        let request = CheckpointRequest::new(
            self.scope.run_id,
            task.id.clone(),
            task.worker.clone(),
            round,
            payload.clone(),
        );
        self.gate
            .request(request, self.config.checkpoint_timeout)
            .await
    }

    /// Invocation context: everything committed so far, plus this task's
    /// dependency outputs and any checkpoint feedback it received.
    async fn task_context(&self, task: &TaskSpec) -> serde_json::Value {
        let mut context = self.context.snapshot().await;
        if let Some(map) = context.as_object_mut() {
            let dependencies: serde_json::Map<String, serde_json::Value> = task
                .depends_on
                .iter()
                .filter_map(|dep| map.get(dep).map(|v| (dep.clone(), v.clone())))
                .collect();
            map.insert(
                "dependencies".to_string(),
                serde_json::Value::Object(dependencies),
            );
            if let Some(feedback) = map.get(&feedback_key(&task.id)).cloned() {
                map.insert("feedback".to_string(), feedback);
            }
        }
        context
    }

    async fn fail(&self, task_id: &str, error: TaskError) {
        if let Some(Err(e)) = self.state.update(task_id, |r| r.fail(error)).await {
            tracing::warn!(task_id, error = %e, "Could not record task failure");
        }
    }

    /// Pending with every dependency succeeded.
    async fn is_ready(&self, task: &TaskSpec) -> bool {
        if self.state.status(&task.id).await != Some(TaskStatus::Pending) {
            return false;
        }
        for dep in &task.depends_on {
            if self.state.status(dep).await != Some(TaskStatus::Succeeded) {
                return false;
            }
        }
        true
    }

    async fn ready_tasks(&self, graph: &TaskGraph) -> Vec<String> {
        let mut ready = Vec::new();
        for task in graph.tasks() {
            if self.is_ready(task).await {
                ready.push(task.id.clone());
            }
        }
        ready
    }

    /// Fail pending tasks whose dependencies ended without succeeding.
    /// Declared order is topological, so one pass covers transitive chains.
    async fn cascade_dependency_failures(&self, graph: &TaskGraph) {
        for task in graph.tasks() {
            if self.state.status(&task.id).await != Some(TaskStatus::Pending) {
                continue;
            }
            let mut blocked_by = None;
            for dep in &task.depends_on {
                match self.state.status(dep).await {
                    Some(status) if status.is_terminal() && status != TaskStatus::Succeeded => {
                        blocked_by = Some(dep.clone());
                        break;
                    }
                    _ => {}
                }
            }
            if let Some(dep) = blocked_by {
                tracing::info!(task_id = %task.id, dependency = %dep, "Dependency failed, skipping task");
                self.fail(
                    &task.id,
                    TaskError::new(
                        ErrorKind::DependencyFailed,
                        format!("dependency {dep} did not succeed"),
                    ),
                )
                .await;
            }
        }
    }

    /// If every unfinished task depends on `failed`, cancel them all and
    /// report the abort.
    async fn check_load_bearing(&self, graph: &TaskGraph, failed: &str) -> Option<TaskError> {
        let mut remaining = Vec::new();
        for task in graph.tasks() {
            let terminal = self
                .state
                .status(&task.id)
                .await
                .is_none_or(|s| s.is_terminal());
            if !terminal {
                remaining.push(task.id.clone());
            }
        }

        if remaining.is_empty()
            || !remaining
                .iter()
                .all(|id| graph.depends_transitively(id, failed))
        {
            return None;
        }

        let cause = self
            .state
            .get(failed)
            .await
            .and_then(|r| r.error)
            .map(|e| e.to_string())
            .unwrap_or_default();
        let error = TaskError::new(
            ErrorKind::RunAborted,
            format!("load-bearing task {failed} failed: {cause}"),
        );
        tracing::warn!(run_id = %self.scope.run_id, task_id = failed, "Load-bearing task failed, aborting run");

        for id in &remaining {
            let error = error.clone();
            self.state.update(id, |r| r.cancel(error)).await;
        }
        Some(error)
    }

    /// Mark every unfinished task cancelled and withdraw open checkpoints.
    async fn cancel_unterminated(&self) {
        let withdrawn = self.gate.withdraw_run(self.scope.run_id).await;
        let error = TaskError::new(ErrorKind::RunCancelled, "run cancelled");
        let unfinished = self.state.unterminated().await;
        for id in &unfinished {
            let error = error.clone();
            self.state.update(id, |r| r.cancel(error)).await;
        }
        tracing::info!(
            run_id = %self.scope.run_id,
            cancelled = unfinished.len(),
            withdrawn,
            "Run cancelled"
        );
    }
}
