use chrono::{DateTime, Utc};
use drover_core::Priority;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a task.
///
/// `Pending → InProgress → {Completed | Failed | Cancelled}`, with
/// `InProgress → Pending` taken while retries remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

/// What a caller submits: everything about a task except its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Discriminator matched against the agent's capabilities.
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    /// Overrides the agent's default retry budget when set.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            description: String::new(),
            input: serde_json::Value::Null,
            context: serde_json::Value::Null,
            priority: Priority::default(),
            max_retries: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
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

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A unit of work owned by exactly one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    pub input: serde_json::Value,
    pub context: serde_json::Value,
    pub priority: Priority,
    pub status: TaskStatus,
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set on completion. Mutually exclusive with `error`.
    pub result: Option<serde_json::Value>,
    /// Set on final failure. Mutually exclusive with `result`.
    pub error: Option<String>,
}

impl Task {
    /// Build a pending task from a spec, falling back to `default_max_retries`
    /// when the [`TaskSpec`] does not set its own budget.
    pub fn from_spec(spec: TaskSpec, default_max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: spec.task_type,
            description: spec.description,
            input: spec.input,
            context: spec.context,
            priority: spec.priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Counts toward the agent's admission limit.
    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::InProgress)
    }

    /// Wall-clock time of the latest attempt, once it has finished.
    pub fn execution_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        u64::try_from((completed - started).num_milliseconds()).ok()
    }
}

/// Criteria for [`crate::Agent::get_tasks`]. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
}

impl TaskFilter {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| s == task.status)
            && self
                .task_type
                .as_deref()
                .map_or(true, |t| t == task.task_type)
    }
}

/// A named unit of work an agent declares it can execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Additional task types served by this capability.
    #[serde(default)]
    pub specializations: Vec<String>,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            specializations: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_specializations(mut self, tags: Vec<String>) -> Self {
        self.specializations = tags;
        self
    }

    /// Name equality or membership in the specialization tags.
    pub fn supports(&self, task_type: &str) -> bool {
        self.name == task_type || self.specializations.iter().any(|s| s == task_type)
    }
}

/// Orchestrator-side view of an agent's availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
    /// Fresh, but every admission slot is taken.
    Busy,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Inactive => write!(f, "inactive"),
            AgentStatus::Busy => write!(f, "busy"),
        }
    }
}

/// Lifetime counters kept by an agent. Unlike the task map these survive
/// retention eviction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub attempts: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub total_execution_ms: u64,
    pub messages_processed: u64,
    pub errors: u64,
}

/// Snapshot returned by [`crate::Agent::get_stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStats {
    pub agent_id: String,
    pub name: String,
    pub total_tasks: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// `succeeded / (succeeded + failed)` over the agent's lifetime, 0 when
    /// nothing has finished yet.
    pub success_rate: f64,
    pub average_execution_ms: f64,
    /// In-flight tasks divided by `max_concurrent_tasks`.
    pub current_load: f64,
    pub capabilities: Vec<String>,
    pub uptime_ms: u64,
    pub last_activity: DateTime<Utc>,
    pub running: bool,
    pub queued_messages: usize,
    pub metrics: AgentMetrics,
}
