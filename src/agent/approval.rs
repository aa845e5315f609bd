//! Human checkpoint gate.
//!
//! A task that requires a checkpoint parks its candidate payload here until a
//! reviewer approves or rejects it. Requests are broadcast to subscribers and
//! resolved by id; the waiting task holds the receiving end of a oneshot.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast, oneshot};
use uuid::Uuid;

use crate::error::CheckpointError;

/// A candidate payload waiting for review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub id: Uuid,
    pub run_id: Uuid,
    pub task_id: String,
    pub worker: String,
    /// 1-based review round for this task.
    pub round: u32,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl CheckpointRequest {
    pub fn new(
        run_id: Uuid,
        task_id: impl Into<String>,
        worker: impl Into<String>,
        round: u32,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            task_id: task_id.into(),
            worker: worker.into(),
            round,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// A reviewer's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum CheckpointDecision {
    Approve { feedback: Option<String> },
    Reject { feedback: String },
}

struct PendingCheckpoint {
    request: CheckpointRequest,
    response_tx: oneshot::Sender<CheckpointDecision>,
}

/// Routes checkpoint requests to reviewers and decisions back to tasks.
pub struct CheckpointGate {
    pending: RwLock<HashMap<Uuid, PendingCheckpoint>>,
    events: broadcast::Sender<CheckpointRequest>,
}

impl Default for CheckpointGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointGate {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            pending: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Receive every checkpoint request raised after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CheckpointRequest> {
        self.events.subscribe()
    }

    /// Park `request` and wait for a decision.
    ///
    /// With no reviewer subscribed there is nobody to ask, so the request is
    /// approved immediately.
    pub async fn request(
        &self,
        request: CheckpointRequest,
        timeout: Option<Duration>,
    ) -> Result<CheckpointDecision, CheckpointError> {
        if self.events.receiver_count() == 0 {
            tracing::warn!(
                task_id = %request.task_id,
                "No checkpoint reviewer subscribed, approving automatically"
            );
            return Ok(CheckpointDecision::Approve { feedback: None });
        }

        let id = request.id;
        let task_id = request.task_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(
            id,
            PendingCheckpoint {
                request: request.clone(),
                response_tx: tx,
            },
        );

        tracing::info!(
            checkpoint_id = %id,
            task_id = %task_id,
            round = request.round,
            "Checkpoint requested"
        );
        // Reviewers may have gone away since the count check; the request
        // stays listed in `pending()` either way.
        let _ = self.events.send(request);

        let decision = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.write().await.remove(&id);
                    tracing::warn!(checkpoint_id = %id, task_id = %task_id, "Checkpoint timed out");
                    return Err(CheckpointError::Timeout {
                        task_id,
                        timeout: limit,
                    });
                }
            },
            None => rx.await,
        };

        decision.map_err(|_| CheckpointError::Withdrawn { id })
    }

    /// Deliver a decision for a pending checkpoint.
    pub async fn resolve(
        &self,
        id: Uuid,
        decision: CheckpointDecision,
    ) -> Result<(), CheckpointError> {
        let pending = self
            .pending
            .write()
            .await
            .remove(&id)
            .ok_or(CheckpointError::NotFound { id })?;

        tracing::info!(
            checkpoint_id = %id,
            task_id = %pending.request.task_id,
            approved = matches!(decision, CheckpointDecision::Approve { .. }),
            "Checkpoint resolved"
        );
        // The task may have been cancelled meanwhile.
        let _ = pending.response_tx.send(decision);
        Ok(())
    }

    pub async fn approve(&self, id: Uuid) -> Result<(), CheckpointError> {
        self.resolve(id, CheckpointDecision::Approve { feedback: None })
            .await
    }

    pub async fn reject(&self, id: Uuid, feedback: impl Into<String>) -> Result<(), CheckpointError> {
        self.resolve(
            id,
            CheckpointDecision::Reject {
                feedback: feedback.into(),
            },
        )
        .await
    }

    /// Requests still waiting for a decision, oldest first.
    pub async fn pending(&self) -> Vec<CheckpointRequest> {
        let mut requests: Vec<_> = self
            .pending
            .read()
            .await
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Drop every pending request of `run_id`. Waiting tasks see `Withdrawn`.
    pub async fn withdraw_run(&self, run_id: Uuid) -> usize {
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|_, p| p.request.run_id != run_id);
        let withdrawn = before - pending.len();
        if withdrawn > 0 {
            tracing::debug!(%run_id, withdrawn, "Withdrew pending checkpoints");
        }
        withdrawn
    }
}
