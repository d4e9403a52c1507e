//! Agent pool orchestration: per-agent task queues, capacity-aware dispatch,
//! multi-step workflows, inter-agent messaging and self-healing.
//!
//! Each [`Agent`] owns a task map and an inbox and advances them from its own
//! fixed-interval loop. The [`Orchestrator`] registers agents by type, places
//! tasks on the least-loaded eligible agent, drives sequential and parallel
//! workflows, routes messages between agents, and restarts agents that fail.
//!
//! # Main types
//!
//! - [`Agent`] - Worker with a task queue, retry policy and message handling.
//! - [`TaskExecutor`] - The capability behind an agent.
//! - [`Orchestrator`] - Registry, dispatcher, workflow engine and health supervisor.
//! - [`WorkflowDefinition`] - A sequential or parallel set of steps.
//! - [`CollisionDetector`] - Optional deduplication collaborator.
//! - [`DroverConfig`] - TOML configuration for an orchestrator and its agents.

/// The agent and its processing loop.
pub mod agent;
/// Agent selection strategies.
pub mod balancer;
/// Duplicate-task detection collaborator.
pub mod collision;
/// Agent, orchestrator and file configuration.
pub mod config;
/// Orchestrator engine.
pub mod engine;
/// Agent and orchestrator events, plus the fan-out hub.
pub mod events;
/// The executor trait implemented by agent capabilities.
pub mod executor;
/// Registration records and health assessment.
pub mod monitor;
/// Per-agent task map with status transitions.
pub mod task_queue;
/// Shared task, capability and stats types.
pub mod types;
/// Workflow definitions and runtime records.
pub mod workflow;

pub use agent::Agent;
pub use balancer::{select_agent, SelectionStrategy};
pub use collision::{
    collaborator_error, content_fingerprint, CollisionCheck, CollisionDetector,
    InMemoryCollisionDetector, TaskAssignmentRecord, TaskCompletionRecord,
};
pub use config::{AgentConfig, AgentEntry, DroverConfig, OrchestratorConfig};
pub use engine::{Orchestrator, TaskAssignment};
pub use events::{AgentEvent, EventHub, OrchestratorEvent};
pub use executor::TaskExecutor;
pub use monitor::{AgentMonitor, AgentRegistration, RegistrationInfo};
pub use task_queue::{FailureOutcome, TaskQueue};
pub use types::{
    AgentMetrics, AgentStats, AgentStatus, CapabilityDescriptor, Task, TaskFilter, TaskSpec,
    TaskStatus,
};
pub use workflow::{
    TaskDefinition, Workflow, WorkflowDefinition, WorkflowKind, WorkflowStatus,
    WorkflowTaskResult,
};
