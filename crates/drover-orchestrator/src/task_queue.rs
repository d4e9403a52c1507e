use crate::types::{Task, TaskFilter, TaskStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// What the retry policy decided after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to pending; `retry_count` is the number of retries granted so far.
    Retrying { retry_count: u32 },
    /// Retry budget exhausted; the task is now `Failed`.
    Failed,
}

/// An agent's task map, kept in submission order.
///
/// Every transition checks the current status, so stale results (e.g. an
/// executor returning after its task was cancelled) are ignored.
pub struct TaskQueue {
    tasks: HashMap<Uuid, Task>,
    order: Vec<Uuid>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Add a task to the queue.
    pub fn add(&mut self, task: Task) -> Uuid {
        let id = task.id;
        if self.tasks.insert(id, task).is_none() {
            self.order.push(id);
        }
        id
    }

    /// Get a task by ID.
    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Tasks matching the filter, in submission order.
    pub fn filter(&self, filter: &TaskFilter) -> Vec<&Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| filter.matches(t))
            .collect()
    }

    /// Pending tasks in the order a tick should advance them: highest
    /// priority first, submission order within a priority.
    pub fn pending_ids(&self) -> Vec<Uuid> {
        let mut pending: Vec<(usize, &Task)> = self
            .order
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| self.tasks.get(id).map(|t| (pos, t)))
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|(pa, a), (pb, b)| b.priority.cmp(&a.priority).then(pa.cmp(pb)));
        pending.into_iter().map(|(_, t)| t.id).collect()
    }

    /// Pending plus in-progress tasks.
    pub fn in_flight_count(&self) -> usize {
        self.tasks.values().filter(|t| t.is_in_flight()).count()
    }

    /// Ids of tasks currently executing.
    pub fn in_progress_ids(&self) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|t| t.status == TaskStatus::InProgress)
            })
            .copied()
            .collect()
    }

    /// Move a pending task to in-progress and return a snapshot for the
    /// executor. Returns `None` if the task is missing or no longer pending.
    pub fn mark_in_progress(&mut self, id: Uuid) -> Option<Task> {
        let task = self.tasks.get_mut(&id)?;
        if task.status != TaskStatus::Pending {
            return None;
        }
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        Some(task.clone())
    }

    /// Record a successful attempt. Ignored unless the task is in progress.
    pub fn mark_completed(&mut self, id: Uuid, result: serde_json::Value) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::InProgress => {
                task.status = TaskStatus::Completed;
                task.result = Some(result);
                task.error = None;
                task.completed_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Apply the retry policy to a failed attempt.
    ///
    /// While `retry_count < max_retries` the task goes back to pending, so a
    /// task that always fails runs `max_retries + 1` times in total.
    pub fn record_failure(&mut self, id: Uuid, error: String) -> Option<FailureOutcome> {
        let task = self.tasks.get_mut(&id)?;
        if task.status != TaskStatus::InProgress {
            return None;
        }
        if task.retry_count < task.max_retries {
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            Some(FailureOutcome::Retrying {
                retry_count: task.retry_count,
            })
        } else {
            task.status = TaskStatus::Failed;
            task.result = None;
            task.error = Some(error);
            task.completed_at = Some(Utc::now());
            Some(FailureOutcome::Failed)
        }
    }

    /// Cancel a non-terminal task. Returns false if it is unknown or already
    /// terminal, so repeated calls return true at most once.
    pub fn cancel(&mut self, id: Uuid) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) if !task.is_terminal() => {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Cancel every in-progress task and return their ids.
    pub fn cancel_in_progress(&mut self) -> Vec<Uuid> {
        let ids = self.in_progress_ids();
        for id in &ids {
            self.cancel(*id);
        }
        ids
    }

    /// Drop terminal tasks whose completion is older than `retention`.
    pub fn evict_terminal(&mut self, retention: Duration, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let before = self.tasks.len();
        self.tasks.retain(|_, t| {
            !(t.is_terminal() && t.completed_at.is_some_and(|done| now - done > retention))
        });
        let tasks = &self.tasks;
        self.order.retain(|id| tasks.contains_key(id));
        before - self.tasks.len()
    }

    /// Count of tasks in the given status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Total number of tasks.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
