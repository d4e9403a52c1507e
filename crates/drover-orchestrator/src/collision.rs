use crate::types::{Task, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover_core::{DroverError, DroverResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

/// Answer from a collision check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollisionCheck {
    /// An agent that already owns an equivalent task.
    pub suggested_agent: Option<String>,
}

/// Sent when the orchestrator places a task on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentRecord {
    pub task_id: Uuid,
    pub agent_id: String,
    pub agent_type: String,
    pub task_type: String,
    pub fingerprint: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

/// Sent when a task owned by a registered agent reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletionRecord {
    pub task_id: Uuid,
    pub agent_id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub execution_ms: Option<u64>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl TaskCompletionRecord {
    pub fn from_task(agent_id: &str, task: &Task) -> Self {
        Self {
            task_id: task.id,
            agent_id: agent_id.to_string(),
            task_type: task.task_type.clone(),
            status: task.status,
            execution_ms: task.execution_ms(),
            error: task.error.clone(),
            completed_at: task.completed_at.unwrap_or_else(Utc::now),
        }
    }
}

/// External deduplication and audit service.
///
/// Everything here is best effort from the orchestrator's side: failures are
/// logged and dispatch carries on as if no detector were configured.
#[async_trait]
pub trait CollisionDetector: Send + Sync {
    fn fingerprint(&self, description: &str, context: &serde_json::Value) -> String {
        content_fingerprint(description, context)
    }

    /// Whether one of `candidates` already owns a task with this fingerprint.
    async fn check_collision(
        &self,
        fingerprint: &str,
        candidates: &[String],
    ) -> DroverResult<CollisionCheck>;

    async fn record_task_assignment(&self, _record: TaskAssignmentRecord) -> DroverResult<()> {
        Ok(())
    }

    async fn record_task_completion(&self, _record: TaskCompletionRecord) -> DroverResult<()> {
        Ok(())
    }
}

/// SHA-256 over the description and the context's JSON form, hex encoded.
/// Object keys serialize sorted, so equal contexts hash equally.
pub fn content_fingerprint(description: &str, context: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    hasher.update(b"\n");
    hasher.update(context.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Report a detector failure as a [`DroverError::Collaborator`] naming the
/// call that failed. Errors already in that category pass through.
pub fn collaborator_error(operation: &str, err: DroverError) -> DroverError {
    match err {
        DroverError::Collaborator(_) => err,
        other => DroverError::Collaborator(format!("{operation}: {other}")),
    }
}

/// Keeps fingerprint ownership in memory for the lifetime of the process.
#[derive(Default)]
pub struct InMemoryCollisionDetector {
    inner: Mutex<Ownership>,
}

#[derive(Default)]
struct Ownership {
    /// fingerprint -> (agent, task)
    owners: HashMap<String, (String, Uuid)>,
    /// task -> fingerprint
    by_task: HashMap<Uuid, String>,
}

impl InMemoryCollisionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fingerprints currently owned by an in-flight task.
    pub fn tracked(&self) -> usize {
        self.inner.lock().owners.len()
    }
}

#[async_trait]
impl CollisionDetector for InMemoryCollisionDetector {
    async fn check_collision(
        &self,
        fingerprint: &str,
        candidates: &[String],
    ) -> DroverResult<CollisionCheck> {
        let inner = self.inner.lock();
        let suggested_agent = inner
            .owners
            .get(fingerprint)
            .filter(|(agent_id, _)| candidates.contains(agent_id))
            .map(|(agent_id, _)| agent_id.clone());
        Ok(CollisionCheck { suggested_agent })
    }

    async fn record_task_assignment(&self, record: TaskAssignmentRecord) -> DroverResult<()> {
        if let Some(fingerprint) = record.fingerprint {
            let mut inner = self.inner.lock();
            inner.by_task.insert(record.task_id, fingerprint.clone());
            inner
                .owners
                .insert(fingerprint, (record.agent_id, record.task_id));
        }
        Ok(())
    }

    async fn record_task_completion(&self, record: TaskCompletionRecord) -> DroverResult<()> {
        let mut inner = self.inner.lock();
        if let Some(fingerprint) = inner.by_task.remove(&record.task_id) {
            // A newer equivalent task may own the fingerprint by now
            if inner
                .owners
                .get(&fingerprint)
                .is_some_and(|(_, task_id)| *task_id == record.task_id)
            {
                inner.owners.remove(&fingerprint);
            }
        }
        Ok(())
    }
}
