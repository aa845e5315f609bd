//! Task state machine and the per-run result board.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::TaskError;

/// State of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or a scheduling slot.
    Pending,
    /// Worker invocation in flight.
    Running,
    /// Payload committed to the context store.
    Succeeded,
    /// Task failed; the error says why.
    Failed,
    /// Candidate payload waiting for a human decision.
    AwaitingCheckpoint,
    /// Stopped by cancellation or an aborted run.
    Cancelled,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending (Failed covers dependency failures)
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) |
            // From Running
            (Running, Succeeded) | (Running, Failed) |
            (Running, AwaitingCheckpoint) | (Running, Cancelled) |
            // From AwaitingCheckpoint (approve, reject, give up)
            (AwaitingCheckpoint, Running) | (AwaitingCheckpoint, Pending) |
            (AwaitingCheckpoint, Failed) | (AwaitingCheckpoint, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::AwaitingCheckpoint => "awaiting_checkpoint",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Outcome of one task in a run. Last write wins when a task is re-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub worker: String,
    pub status: TaskStatus,
    /// Output matching the task's expected-output contract.
    pub payload: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    /// Worker invocations made for this task (re-runs after rejection count).
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<TaskTransition>,
}

impl TaskResult {
    pub fn new(task_id: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            worker: worker.into(),
            status: TaskStatus::Pending,
            payload: None,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_status: TaskStatus,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition task {} from {} to {}",
                self.task_id, self.status, new_status
            ));
        }

        self.transitions.push(TaskTransition {
            from: self.status,
            to: new_status,
            timestamp: Utc::now(),
            reason,
        });
        self.status = new_status;

        match new_status {
            TaskStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            s if s.is_terminal() => {
                self.finished_at = Some(Utc::now());
            }
            _ => {}
        }

        Ok(())
    }

    /// Move to `Failed` with the given error.
    pub fn fail(&mut self, error: TaskError) -> Result<(), String> {
        let reason = error.to_string();
        self.transition_to(TaskStatus::Failed, Some(reason))?;
        self.error = Some(error);
        Ok(())
    }

    /// Move to `Cancelled`, recording why.
    pub fn cancel(&mut self, error: TaskError) -> Result<(), String> {
        let reason = error.to_string();
        self.transition_to(TaskStatus::Cancelled, Some(reason))?;
        self.error = Some(error);
        Ok(())
    }
}

/// One entry of the run-wide transition log, in the order applied.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub seq: u64,
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Default)]
struct Board {
    order: Vec<String>,
    results: HashMap<String, TaskResult>,
    events: Vec<TaskEvent>,
}

/// Results of every task in one run, behind a single lock.
#[derive(Default)]
pub struct RunState {
    board: RwLock<Board>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new task in `Pending`. Returns false, keeping the old
    /// result, when the id is already tracked.
    pub async fn insert(&self, task_id: &str, worker: &str) -> bool {
        let mut board = self.board.write().await;
        if board.results.contains_key(task_id) {
            return false;
        }
        board.order.push(task_id.to_string());
        board
            .results
            .insert(task_id.to_string(), TaskResult::new(task_id, worker));
        true
    }

    /// Snapshot of one task's result.
    pub async fn get(&self, task_id: &str) -> Option<TaskResult> {
        self.board.read().await.results.get(task_id).cloned()
    }

    pub async fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.board.read().await.results.get(task_id).map(|r| r.status)
    }

    /// Mutate a task's result under the lock. Status changes made inside
    /// `f` are appended to the run-wide log.
    pub async fn update<F, R>(&self, task_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut TaskResult) -> R,
    {
        let mut board = self.board.write().await;
        let board = &mut *board;
        let result = board.results.get_mut(task_id)?;
        let before = result.transitions.len();
        let out = f(result);

        for transition in &result.transitions[before..] {
            let seq = board.events.len() as u64;
            board.events.push(TaskEvent {
                seq,
                task_id: task_id.to_string(),
                from: transition.from,
                to: transition.to,
            });
        }
        Some(out)
    }

    /// Apply a transition, logging any rejected edge.
    pub async fn transition(&self, task_id: &str, to: TaskStatus, reason: Option<String>) -> bool {
        match self
            .update(task_id, |r| r.transition_to(to, reason))
            .await
        {
            Some(Ok(())) => {
                tracing::debug!(task_id, status = %to, "Task transitioned");
                true
            }
            Some(Err(e)) => {
                tracing::warn!(task_id, error = %e, "Rejected task transition");
                false
            }
            None => false,
        }
    }

    /// Ids of tasks not yet in a terminal state, in insertion order.
    pub async fn unterminated(&self) -> Vec<String> {
        let board = self.board.read().await;
        board
            .order
            .iter()
            .filter(|id| board.results.get(*id).is_some_and(|r| !r.status.is_terminal()))
            .cloned()
            .collect()
    }

    /// All results keyed by task id.
    pub async fn results(&self) -> BTreeMap<String, TaskResult> {
        self.board
            .read()
            .await
            .results
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect()
    }

    /// The run-wide transition log.
    pub async fn events(&self) -> Vec<TaskEvent> {
        self.board.read().await.events.clone()
    }
}
