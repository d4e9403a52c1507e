use crate::agent::Agent;
use crate::types::{AgentStats, AgentStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// The orchestrator's record of one registered agent.
pub struct AgentRegistration {
    pub agent: Arc<Agent>,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    /// Fraction of admission capacity in use, as of the last refresh.
    pub current_load: f64,
    pub last_health_check: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl AgentRegistration {
    pub fn new(agent: Arc<Agent>, agent_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            capabilities: agent.capability_names(),
            current_load: agent.current_load(),
            agent,
            agent_type: agent_type.into(),
            status: AgentStatus::Active,
            last_health_check: now,
            registered_at: now,
        }
    }

    pub fn agent_id(&self) -> &str {
        self.agent.id()
    }

    pub fn info(&self) -> RegistrationInfo {
        RegistrationInfo {
            agent_id: self.agent.id().to_string(),
            name: self.agent.name().to_string(),
            agent_type: self.agent_type.clone(),
            capabilities: self.capabilities.clone(),
            status: self.status,
            current_load: self.current_load,
            last_health_check: self.last_health_check,
            registered_at: self.registered_at,
        }
    }
}

/// Serializable snapshot of an [`AgentRegistration`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub agent_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub current_load: f64,
    pub last_health_check: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// An agent eligible for dispatch, with its load read at selection time.
#[derive(Clone)]
pub struct Candidate {
    pub agent_id: String,
    pub agent: Arc<Agent>,
    pub load: f64,
}

/// A status change produced by a health refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub agent_id: String,
    pub from: AgentStatus,
    pub to: AgentStatus,
}

/// Health verdict for one agent's stats.
pub fn assess(stats: &AgentStats, stale_after: Duration, now: DateTime<Utc>) -> AgentStatus {
    let stale_after = chrono::Duration::from_std(stale_after)
        .unwrap_or_else(|_| chrono::Duration::days(36_500));
    if !stats.running || now - stats.last_activity > stale_after {
        AgentStatus::Inactive
    } else if stats.current_load >= 1.0 {
        AgentStatus::Busy
    } else {
        AgentStatus::Active
    }
}

/// Registry of agents in registration order.
///
/// Not synchronized itself; the orchestrator wraps it in a lock so
/// registration and health checks never interleave.
#[derive(Default)]
pub struct AgentMonitor {
    registrations: Vec<AgentRegistration>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.get(agent_id).is_some()
    }

    pub fn insert(&mut self, registration: AgentRegistration) {
        self.registrations.push(registration);
    }

    pub fn remove(&mut self, agent_id: &str) -> Option<AgentRegistration> {
        let idx = self
            .registrations
            .iter()
            .position(|r| r.agent_id() == agent_id)?;
        Some(self.registrations.remove(idx))
    }

    /// Remove every registration, oldest first.
    pub fn drain(&mut self) -> Vec<AgentRegistration> {
        std::mem::take(&mut self.registrations)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentRegistration> {
        self.registrations.iter().find(|r| r.agent_id() == agent_id)
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.get(agent_id).map(|r| Arc::clone(&r.agent))
    }

    pub fn agents(&self) -> Vec<Arc<Agent>> {
        self.registrations
            .iter()
            .map(|r| Arc::clone(&r.agent))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<RegistrationInfo> {
        self.registrations.iter().map(|r| r.info()).collect()
    }

    /// Set a registration's status, returning the transition if it changed.
    pub fn set_status(&mut self, agent_id: &str, status: AgentStatus) -> Option<StatusTransition> {
        let reg = self
            .registrations
            .iter_mut()
            .find(|r| r.agent_id() == agent_id)?;
        if reg.status == status {
            return None;
        }
        let from = std::mem::replace(&mut reg.status, status);
        Some(StatusTransition {
            agent_id: agent_id.to_string(),
            from,
            to: status,
        })
    }

    /// Active registrations of `agent_type` whose load is below `max_load`,
    /// in registration order. Loads are re-read from the agents and stored.
    pub fn candidates(&mut self, agent_type: &str, max_load: f64) -> Vec<Candidate> {
        let mut out = Vec::new();
        for reg in self
            .registrations
            .iter_mut()
            .filter(|r| r.agent_type == agent_type && r.status == AgentStatus::Active)
        {
            reg.current_load = reg.agent.current_load();
            if reg.current_load < max_load {
                out.push(Candidate {
                    agent_id: reg.agent_id().to_string(),
                    agent: Arc::clone(&reg.agent),
                    load: reg.current_load,
                });
            }
        }
        out
    }

    /// One health-check pass over every registration.
    pub fn refresh(&mut self, stale_after: Duration, now: DateTime<Utc>) -> Vec<StatusTransition> {
        let mut transitions = Vec::new();
        for reg in &mut self.registrations {
            let stats = reg.agent.get_stats();
            let status = assess(&stats, stale_after, now);
            reg.current_load = stats.current_load;
            reg.last_health_check = now;
            if reg.status != status {
                transitions.push(StatusTransition {
                    agent_id: stats.agent_id,
                    from: reg.status,
                    to: status,
                });
                reg.status = status;
            }
        }
        transitions
    }
}
