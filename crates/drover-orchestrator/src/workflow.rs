use chrono::{DateTime, Utc};
use drover_core::{DroverError, DroverResult, Priority};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// How a workflow's steps are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowKind {
    /// One step at a time, in definition order; the first failure aborts.
    Sequential,
    /// Every step dispatched at once, subject to declared dependencies.
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::InProgress => write!(f, "in_progress"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Only needed when other steps depend on this one.
    #[serde(default)]
    pub id: Option<String>,
    pub agent_type: String,
    pub task_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Overrides the orchestrator's default task timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskDefinition {
    pub fn new(agent_type: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: None,
            agent_type: agent_type.into(),
            task_type: task_type.into(),
            description: None,
            input: serde_json::Value::Null,
            dependencies: Vec::new(),
            timeout_ms: None,
            max_retries: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Label used in logs and errors: the step id, or its 1-based position.
    pub fn label(&self, index: usize) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!("#{}", index + 1),
        }
    }
}

/// A workflow as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: WorkflowKind,
    pub tasks: Vec<TaskDefinition>,
    /// Attached to every task the workflow dispatches.
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, kind: WorkflowKind, tasks: Vec<TaskDefinition>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind,
            tasks,
            context: serde_json::Value::Null,
            priority: Priority::default(),
        }
    }

    pub fn sequential(name: impl Into<String>, tasks: Vec<TaskDefinition>) -> Self {
        Self::new(name, WorkflowKind::Sequential, tasks)
    }

    pub fn parallel(name: impl Into<String>, tasks: Vec<TaskDefinition>) -> Self {
        Self::new(name, WorkflowKind::Parallel, tasks)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn from_toml_str(raw: &str) -> DroverResult<Self> {
        toml::from_str(raw).map_err(|e| DroverError::Workflow(format!("invalid workflow: {e}")))
    }

    pub fn from_json_str(raw: &str) -> DroverResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Read a workflow file; `.json` is parsed as JSON, anything else as TOML.
    pub async fn load(path: &Path) -> DroverResult<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_toml_str(&raw)
        }
    }

    /// Structural checks done before anything is dispatched.
    pub fn validate(&self) -> DroverResult<()> {
        if self.tasks.is_empty() {
            return Err(DroverError::Workflow(format!(
                "workflow '{}' has no tasks",
                self.name
            )));
        }

        let mut index_of: HashMap<&str, usize> = HashMap::new();
        for (idx, task) in self.tasks.iter().enumerate() {
            if task.agent_type.is_empty() || task.task_type.is_empty() {
                return Err(DroverError::Workflow(format!(
                    "step {} needs both agent_type and task_type",
                    task.label(idx)
                )));
            }
            if let Some(id) = &task.id {
                if index_of.insert(id.as_str(), idx).is_some() {
                    return Err(DroverError::Workflow(format!("duplicate step id '{id}'")));
                }
            }
        }

        for (idx, task) in self.tasks.iter().enumerate() {
            for dep in &task.dependencies {
                let Some(&dep_idx) = index_of.get(dep.as_str()) else {
                    return Err(DroverError::Workflow(format!(
                        "step {} depends on unknown step '{dep}'",
                        task.label(idx)
                    )));
                };
                if self.kind == WorkflowKind::Sequential && dep_idx >= idx {
                    return Err(DroverError::Workflow(format!(
                        "step {} depends on '{dep}', which does not run before it",
                        task.label(idx)
                    )));
                }
            }
        }

        if self.has_cycle(&index_of) {
            return Err(DroverError::Workflow(format!(
                "workflow '{}' has a dependency cycle",
                self.name
            )));
        }
        Ok(())
    }

    fn has_cycle(&self, index_of: &HashMap<&str, usize>) -> bool {
        let mut visited = vec![0u8; self.tasks.len()];
        (0..self.tasks.len()).any(|idx| self.dfs_cycle(idx, index_of, &mut visited))
    }

    fn dfs_cycle(&self, idx: usize, index_of: &HashMap<&str, usize>, visited: &mut [u8]) -> bool {
        match visited[idx] {
            1 => return true,  // back edge
            2 => return false, // done
            _ => {}
        }
        visited[idx] = 1;
        for dep in &self.tasks[idx].dependencies {
            if let Some(&dep_idx) = index_of.get(dep.as_str()) {
                if self.dfs_cycle(dep_idx, index_of, visited) {
                    return true;
                }
            }
        }
        visited[idx] = 2;
        false
    }
}

/// Outcome of one successfully finished step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTaskResult {
    /// Position of the step in the definition.
    pub index: usize,
    pub step_id: Option<String>,
    pub agent_id: String,
    pub task_id: Uuid,
    pub task_type: String,
    pub result: serde_json::Value,
}

/// A workflow run as tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: WorkflowKind,
    pub tasks: Vec<TaskDefinition>,
    pub context: serde_json::Value,
    pub priority: Priority,
    pub status: WorkflowStatus,
    /// Sequential: definition order. Parallel: completion order.
    pub results: Vec<WorkflowTaskResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(definition: WorkflowDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: definition.name,
            description: definition.description,
            kind: definition.kind,
            tasks: definition.tasks,
            context: definition.context,
            priority: definition.priority,
            status: WorkflowStatus::Pending,
            results: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a terminal workflow finished longer than `retention` ago.
    pub fn is_expired(&self, retention: Duration, now: DateTime<Utc>) -> bool {
        let retention =
            chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
        self.is_terminal() && self.completed_at.is_some_and(|done| now - done > retention)
    }
}
