use crate::types::CapabilityDescriptor;
use drover_core::{DroverError, DroverResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a single agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable identifier. Generated from `name` when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDescriptor>,
    /// Admission limit: pending plus in-progress tasks.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// How long terminal tasks stay queryable.
    #[serde(default = "default_task_retention_ms")]
    pub task_retention_ms: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

fn default_max_concurrent_tasks() -> usize {
    5
}
fn default_tick_interval_ms() -> u64 {
    100
}
fn default_shutdown_timeout_ms() -> u64 {
    30_000
}
fn default_task_retention_ms() -> u64 {
    3_600_000
}
fn default_max_retries() -> u32 {
    3
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            capabilities: Vec::new(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            tick_interval_ms: default_tick_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            task_retention_ms: default_task_retention_ms(),
            default_max_retries: default_max_retries(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_capability(mut self, capability: CapabilityDescriptor) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_task_retention(mut self, retention: Duration) -> Self {
        self.task_retention_ms = duration_ms(retention);
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_millis(self.task_retention_ms)
    }

    /// Reject values the processing loop cannot work with.
    pub fn validate(&self) -> DroverResult<()> {
        if self.name.trim().is_empty() {
            return Err(DroverError::Config("agent name must not be empty".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(DroverError::Config(format!(
                "agent '{}': max_concurrent_tasks must be at least 1",
                self.name
            )));
        }
        if self.capabilities.is_empty() {
            return Err(DroverError::Config(format!(
                "agent '{}' declares no capabilities",
                self.name
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(DroverError::Config(format!(
                "agent '{}': tick_interval_ms must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Configuration for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// An agent idle for longer than this is reported inactive.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// Least-loaded selection when true, uniform random otherwise.
    #[serde(default = "default_true")]
    pub load_balancing: bool,
    /// Agents at or above this load are not dispatch candidates.
    #[serde(default = "default_max_load")]
    pub max_load: f64,
    #[serde(default = "default_task_timeout_ms")]
    pub default_task_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_workflow_retention_ms")]
    pub workflow_retention_ms: u64,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
}

fn default_max_agents() -> usize {
    50
}
fn default_health_check_interval_ms() -> u64 {
    30_000
}
fn default_stale_after_ms() -> u64 {
    60_000
}
fn default_true() -> bool {
    true
}
fn default_max_load() -> f64 {
    0.8
}
fn default_task_timeout_ms() -> u64 {
    60_000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_workflow_retention_ms() -> u64 {
    3_600_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            health_check_interval_ms: default_health_check_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            load_balancing: true,
            max_load: default_max_load(),
            default_task_timeout_ms: default_task_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            workflow_retention_ms: default_workflow_retention_ms(),
            auto_restart: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn workflow_retention(&self) -> Duration {
        Duration::from_millis(self.workflow_retention_ms)
    }

    pub fn validate(&self) -> DroverResult<()> {
        if self.max_agents == 0 {
            return Err(DroverError::Config("max_agents must be at least 1".into()));
        }
        if !(self.max_load > 0.0 && self.max_load <= 1.0) {
            return Err(DroverError::Config(format!(
                "max_load must be in (0, 1], got {}",
                self.max_load
            )));
        }
        if self.health_check_interval_ms == 0 {
            return Err(DroverError::Config(
                "health_check_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// One `[[agents]]` entry: which executor backs the agent, under which type
/// it is registered, and its agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    #[serde(rename = "type")]
    pub agent_type: String,
    pub executor: String,
    /// How many identical instances to register.
    #[serde(default = "default_instances")]
    pub instances: usize,
    #[serde(flatten)]
    pub agent: AgentConfig,
}

fn default_instances() -> usize {
    1
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DroverConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

impl DroverConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> DroverResult<Self> {
        let config: DroverConfig =
            toml::from_str(raw).map_err(|e| DroverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub async fn load(path: &Path) -> DroverResult<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> DroverResult<()> {
        self.orchestrator.validate()?;
        for entry in &self.agents {
            entry.agent.validate()?;
            if entry.instances == 0 {
                return Err(DroverError::Config(format!(
                    "agent '{}': instances must be at least 1",
                    entry.agent.name
                )));
            }
            if entry.instances > 1 && entry.agent.id.is_some() {
                return Err(DroverError::Config(format!(
                    "agent '{}': a fixed id cannot be shared by {} instances",
                    entry.agent.name, entry.instances
                )));
            }
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
