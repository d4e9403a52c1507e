//! Core types and error definitions for the Drover agent orchestrator.
//!
//! This crate provides the foundational types shared across all Drover crates:
//! the error taxonomy, task/message priorities, and the message envelope agents
//! use to address each other.
//!
//! # Main types
//!
//! - [`DroverError`] - Unified error enum for submission, dispatch, and execution failures.
//! - [`DroverResult`] - Convenience alias for `Result<T, DroverError>`.
//! - [`Priority`] - Four-level priority shared by tasks, workflows, and messages.
//! - [`AgentMessage`] - An envelope routed between agents by identifier.

/// Agent-to-agent message envelope.
pub mod message;

pub use message::{AgentMessage, MessageKind};

use serde::{Deserialize, Serialize};

// --- Error types ---

/// Top-level error type for Drover.
///
/// Submission-time variants are returned synchronously to the caller of the
/// corresponding API; execution-time variants are captured on task and
/// workflow records.
#[derive(Debug, thiserror::Error)]
pub enum DroverError {
    /// An agent or the orchestrator has no room for another task or agent.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The task type matches none of the agent's declared capabilities.
    #[error("Unsupported task type: {0}")]
    UnsupportedTaskType(String),

    /// An agent with the same id is already registered.
    #[error("Duplicate agent: {0}")]
    DuplicateAgent(String),

    /// An agent, task, or workflow lookup failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No active agent of the requested type has spare capacity.
    #[error("No available agent: {0}")]
    NoAvailableAgent(String),

    /// A capability executor failed while running a task.
    #[error("Task execution error: {0}")]
    TaskExecution(String),

    /// A task did not reach a terminal state within its deadline.
    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    TaskTimeout {
        /// The task that was being awaited.
        task_id: String,
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// A message was addressed to an agent that is not registered.
    #[error("Routing failure: {0}")]
    Routing(String),

    /// Agent lifecycle misuse (e.g. starting an agent that is already running).
    #[error("Agent error: {0}")]
    Agent(String),

    /// A workflow definition is malformed or a workflow step failed.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// An external collaborator (deduplication or persistence hook) failed.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`DroverError`].
pub type DroverResult<T> = Result<T, DroverError>;

// --- Priority ---

/// Priority of a task, workflow, or message.
///
/// Ordered so that `Critical > High > Medium > Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// The default priority.
    #[default]
    Medium,
    /// Should run ahead of ordinary work.
    High,
    /// Runs before everything else.
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}
