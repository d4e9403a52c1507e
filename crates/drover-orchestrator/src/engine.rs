use crate::agent::Agent;
use crate::balancer::{select_agent, SelectionStrategy};
use crate::collision::{
    collaborator_error, CollisionCheck, CollisionDetector, TaskAssignmentRecord,
    TaskCompletionRecord,
};
use crate::config::OrchestratorConfig;
use crate::events::{AgentEvent, EventHub, OrchestratorEvent};
use crate::monitor::{AgentMonitor, AgentRegistration, RegistrationInfo, StatusTransition};
use crate::types::{AgentStats, AgentStatus, Task, TaskSpec, TaskStatus};
use crate::workflow::{Workflow, WorkflowDefinition, WorkflowKind, WorkflowStatus, WorkflowTaskResult};
use chrono::{DateTime, Utc};
use drover_core::{AgentMessage, DroverError, DroverResult, Priority};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where [`Orchestrator::submit_task`] placed a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub agent_id: String,
    pub task_id: Uuid,
}

struct HealthLoop {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Immutable view of a workflow handed to its driver.
struct WorkflowRun {
    workflow_id: Uuid,
    name: String,
    kind: WorkflowKind,
    tasks: Vec<crate::workflow::TaskDefinition>,
    context: serde_json::Value,
    priority: Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepState {
    Waiting,
    Succeeded,
    Failed,
}

/// Registry, dispatcher, workflow engine and health supervisor over a pool
/// of [`Agent`]s.
///
/// Cheap to clone; clones share all state. Background work (event pumps,
/// the health loop, workflow drivers) holds clones, so call [`stop`] when
/// done.
///
/// [`stop`]: Orchestrator::stop
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    monitor: Arc<RwLock<AgentMonitor>>,
    workflows: Arc<RwLock<HashMap<Uuid, Workflow>>>,
    pumps: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    restarting: Arc<Mutex<HashSet<String>>>,
    collision: Option<Arc<dyn CollisionDetector>>,
    events: Arc<EventHub<OrchestratorEvent>>,
    health: Arc<Mutex<Option<HealthLoop>>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> DroverResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            monitor: Arc::new(RwLock::new(AgentMonitor::new())),
            workflows: Arc::new(RwLock::new(HashMap::new())),
            pumps: Arc::new(Mutex::new(HashMap::new())),
            restarting: Arc::new(Mutex::new(HashSet::new())),
            collision: None,
            events: Arc::new(EventHub::new()),
            health: Arc::new(Mutex::new(None)),
        })
    }

    /// Consult `detector` before every dispatch and report assignments and
    /// completions to it.
    pub fn with_collision_detector(mut self, detector: Arc<dyn CollisionDetector>) -> Self {
        self.collision = Some(detector);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Whether the health loop is running.
    pub fn is_running(&self) -> bool {
        self.health.lock().is_some()
    }

    // --- Lifecycle ---

    /// Start the periodic health check. Calling it again is a no-op.
    pub fn start(&self) {
        let mut health = self.health.lock();
        if health.is_some() {
            debug!("Orchestrator already started");
            return;
        }
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let orchestrator = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(orchestrator.config.health_check_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => orchestrator.health_check().await,
                }
            }
        });
        *health = Some(HealthLoop { shutdown, handle });
        info!(
            interval_ms = self.config.health_check_interval_ms,
            max_agents = self.config.max_agents,
            "Orchestrator started"
        );
    }

    /// Stop the health loop, then stop and unregister every agent.
    ///
    /// Agents are stopped concurrently. The first stop error is returned
    /// after all of them have been attempted. Workflow records are kept.
    pub async fn stop(&self) -> DroverResult<()> {
        let health = self.health.lock().take();
        if let Some(health) = health {
            health.shutdown.cancel();
            if let Err(e) = health.handle.await {
                warn!(error = %e, "Health loop ended abnormally");
            }
        }

        let registrations = self.monitor.write().await.drain();
        let mut stops = JoinSet::new();
        for registration in registrations {
            let agent_id = registration.agent_id().to_string();
            if let Some(pump) = self.pumps.lock().remove(&agent_id) {
                pump.abort();
            }
            let agent = registration.agent;
            stops.spawn(async move { (agent_id, agent.stop().await) });
        }

        let mut first_error = None;
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((agent_id, Ok(()))) => {
                    self.events
                        .emit(OrchestratorEvent::AgentUnregistered { agent_id });
                }
                Ok((agent_id, Err(e))) => {
                    error!(agent_id = %agent_id, error = %e, "Agent failed to stop cleanly");
                    self.events
                        .emit(OrchestratorEvent::AgentUnregistered { agent_id });
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Agent stop task panicked");
                    first_error.get_or_insert(DroverError::Agent(e.to_string()));
                }
            }
        }
        info!("Orchestrator stopped");
        first_error.map_or(Ok(()), Err)
    }

    // --- Registration ---

    /// Register and start an agent under `agent_type`. Returns its id.
    pub async fn register_agent(
        &self,
        agent: Arc<Agent>,
        agent_type: impl Into<String>,
    ) -> DroverResult<String> {
        let agent_type = agent_type.into();
        let agent_id = agent.id().to_string();

        let mut monitor = self.monitor.write().await;
        if monitor.len() >= self.config.max_agents {
            return Err(DroverError::CapacityExceeded(format!(
                "orchestrator already manages {} agents",
                self.config.max_agents
            )));
        }
        if monitor.contains(&agent_id) {
            return Err(DroverError::DuplicateAgent(agent_id));
        }

        // Subscribe first so the Started event is relayed.
        let events = agent.subscribe();
        if !agent.is_running() {
            agent.start()?;
        }
        let pump = self.spawn_event_pump(events);
        self.pumps.lock().insert(agent_id.clone(), pump);
        monitor.insert(AgentRegistration::new(agent, agent_type.clone()));
        drop(monitor);

        info!(agent_id = %agent_id, agent_type = %agent_type, "Agent registered");
        self.events.emit(OrchestratorEvent::AgentRegistered {
            agent_id: agent_id.clone(),
            agent_type,
        });
        Ok(agent_id)
    }

    /// Remove an agent from the registry and stop it.
    pub async fn unregister_agent(&self, agent_id: &str) -> DroverResult<()> {
        let registration = self
            .monitor
            .write()
            .await
            .remove(agent_id)
            .ok_or_else(|| DroverError::NotFound(format!("agent {agent_id}")))?;
        if let Some(pump) = self.pumps.lock().remove(agent_id) {
            pump.abort();
        }

        let stopped = registration.agent.stop().await;
        info!(agent_id = %agent_id, "Agent unregistered");
        self.events.emit(OrchestratorEvent::AgentUnregistered {
            agent_id: agent_id.to_string(),
        });
        stopped
    }

    pub async fn agent(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.monitor.read().await.agent(agent_id)
    }

    pub async fn agent_count(&self) -> usize {
        self.monitor.read().await.len()
    }

    pub async fn list_agents(&self) -> Vec<RegistrationInfo> {
        self.monitor.read().await.snapshot()
    }

    pub async fn get_agent_stats(&self) -> HashMap<String, AgentStats> {
        let agents = self.monitor.read().await.agents();
        agents
            .into_iter()
            .map(|agent| (agent.id().to_string(), agent.get_stats()))
            .collect()
    }

    fn spawn_event_pump(&self, mut events: mpsc::UnboundedReceiver<AgentEvent>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                orchestrator.handle_agent_event(event).await;
            }
        })
    }

    async fn handle_agent_event(&self, event: AgentEvent) {
        match &event {
            AgentEvent::Outbound { message } => {
                // Failures are logged and reported by route_message
                let _ = self.route_message(message.clone()).await;
            }
            AgentEvent::TaskCompleted { agent_id, task }
            | AgentEvent::TaskFailed { agent_id, task } => {
                self.record_completion(TaskCompletionRecord::from_task(agent_id, task));
            }
            AgentEvent::TaskCancelled { agent_id, task_id } => {
                let agent = self.monitor.read().await.agent(agent_id);
                if let Some(task) = agent.and_then(|a| a.get_task(*task_id)) {
                    self.record_completion(TaskCompletionRecord::from_task(agent_id, &task));
                }
            }
            AgentEvent::Error { agent_id, error } => {
                self.handle_agent_error(agent_id, error).await;
            }
            _ => {}
        }
        self.events.emit(OrchestratorEvent::Agent { event });
    }

    // --- Health ---

    /// One health-check cycle: refresh every registration's load and status,
    /// then evict expired workflow records.
    pub async fn health_check(&self) {
        let now = Utc::now();
        let transitions = self
            .monitor
            .write()
            .await
            .refresh(self.config.stale_after(), now);
        for transition in transitions {
            self.report_transition(transition);
        }
        let evicted = self.evict_workflows(now).await;
        if evicted > 0 {
            debug!(evicted, "Evicted finished workflows");
        }
    }

    fn report_transition(&self, transition: StatusTransition) {
        if transition.to == AgentStatus::Inactive {
            warn!(
                agent_id = %transition.agent_id,
                from = %transition.from,
                "Agent marked inactive"
            );
        } else {
            info!(
                agent_id = %transition.agent_id,
                from = %transition.from,
                to = %transition.to,
                "Agent status changed"
            );
        }
        self.events.emit(OrchestratorEvent::AgentStatusChanged {
            agent_id: transition.agent_id,
            from: transition.from,
            to: transition.to,
        });
    }

    async fn handle_agent_error(&self, agent_id: &str, reason: &str) {
        let transition = {
            let mut monitor = self.monitor.write().await;
            if !monitor.contains(agent_id) {
                return;
            }
            monitor.set_status(agent_id, AgentStatus::Inactive)
        };
        error!(agent_id = %agent_id, error = %reason, "Agent reported an error");
        if let Some(transition) = transition {
            self.report_transition(transition);
        }
        if !self.config.auto_restart {
            return;
        }

        let orchestrator = self.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            // Outcome is already logged and emitted.
            let _ = orchestrator.restart_agent(&agent_id).await;
        });
    }

    /// Stop and start a registered agent.
    ///
    /// On success the registration is marked active again. On failure it
    /// stays as it was and an `AgentRestartFailed` event is emitted; there is
    /// no automatic retry. A restart already in flight for the same agent
    /// makes this a no-op, and an agent unregistered mid-restart stays
    /// stopped.
    pub async fn restart_agent(&self, agent_id: &str) -> DroverResult<()> {
        let agent = self
            .monitor
            .read()
            .await
            .agent(agent_id)
            .ok_or_else(|| DroverError::NotFound(format!("agent {agent_id}")))?;
        if !self.restarting.lock().insert(agent_id.to_string()) {
            debug!(agent_id = %agent_id, "Restart already in progress");
            return Ok(());
        }

        warn!(agent_id = %agent_id, "Restarting agent");
        let result = match agent.stop().await {
            Ok(()) => self.resume_if_registered(agent_id, &agent).await,
            Err(e) => Err(e),
        };
        self.restarting.lock().remove(agent_id);

        match result {
            Ok(None) => {
                info!(agent_id = %agent_id, "Agent left the registry while restarting, not resuming");
                Ok(())
            }
            Ok(Some(transition)) => {
                if let Some(transition) = transition {
                    self.report_transition(transition);
                }
                info!(agent_id = %agent_id, "Agent restarted");
                self.events.emit(OrchestratorEvent::AgentRestarted {
                    agent_id: agent_id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "Agent restart failed");
                self.events.emit(OrchestratorEvent::AgentRestartFailed {
                    agent_id: agent_id.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Start `agent` again if the same instance is still registered under
    /// `agent_id`. Returns `None` when it was unregistered or replaced.
    ///
    /// Runs under the registry write lock: `unregister_agent` and `stop`
    /// remove the registration before stopping the agent, so either they see
    /// the resumed agent or this sees the registration gone.
    async fn resume_if_registered(
        &self,
        agent_id: &str,
        agent: &Arc<Agent>,
    ) -> DroverResult<Option<Option<StatusTransition>>> {
        let mut monitor = self.monitor.write().await;
        let registered = monitor
            .get(agent_id)
            .is_some_and(|r| Arc::ptr_eq(&r.agent, agent));
        if !registered {
            return Ok(None);
        }
        if !agent.is_running() {
            agent.start()?;
        }
        Ok(Some(monitor.set_status(agent_id, AgentStatus::Active)))
    }

    // --- Messaging ---

    /// Deliver a message to the registered agent named in `message.to`.
    ///
    /// Unknown recipients get a `RoutingFailure` event and the message is
    /// dropped.
    pub async fn route_message(&self, message: AgentMessage) -> DroverResult<()> {
        let target = self.monitor.read().await.agent(&message.to);
        match target {
            Some(agent) => {
                debug!(
                    message_id = %message.id,
                    from = %message.from,
                    to = %message.to,
                    kind = ?message.kind,
                    "Routing message"
                );
                agent.receive_message(message);
                Ok(())
            }
            None => {
                warn!(
                    message_id = %message.id,
                    from = %message.from,
                    to = %message.to,
                    "No registered agent for message, dropping it"
                );
                let err = DroverError::Routing(format!("no agent registered as '{}'", message.to));
                self.events.emit(OrchestratorEvent::RoutingFailure {
                    message_id: message.id,
                    from: message.from,
                    to: message.to,
                });
                Err(err)
            }
        }
    }

    // --- Dispatch ---

    /// Place a task on an active agent of `agent_type` whose load is below
    /// `max_load`.
    pub async fn submit_task(
        &self,
        agent_type: &str,
        spec: TaskSpec,
    ) -> DroverResult<TaskAssignment> {
        self.dispatch(agent_type, spec)
            .await
            .map(|(assignment, _)| assignment)
    }

    async fn dispatch(
        &self,
        agent_type: &str,
        spec: TaskSpec,
    ) -> DroverResult<(TaskAssignment, Arc<Agent>)> {
        let mut candidates = self
            .monitor
            .write()
            .await
            .candidates(agent_type, self.config.max_load);
        if candidates.is_empty() {
            return Err(DroverError::NoAvailableAgent(format!(
                "no active '{agent_type}' agent below {:.0}% load",
                self.config.max_load * 100.0
            )));
        }

        let mut fingerprint = None;
        let mut chosen = None;
        if let Some(detector) = &self.collision {
            let fp = detector.fingerprint(&spec.description, &spec.context);
            let ids: Vec<String> = candidates.iter().map(|c| c.agent_id.clone()).collect();
            match detector
                .check_collision(&fp, &ids)
                .await
                .map_err(|e| collaborator_error("check_collision", e))
            {
                Ok(CollisionCheck {
                    suggested_agent: Some(suggested),
                }) => {
                    chosen = candidates.iter().position(|c| c.agent_id == suggested);
                    if chosen.is_some() {
                        info!(
                            agent_id = %suggested,
                            task_type = %spec.task_type,
                            "Equivalent task already owned, forwarding"
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Collision check failed, dispatching normally"),
            }
            fingerprint = Some(fp);
        }

        let idx = match chosen {
            Some(idx) => idx,
            None => {
                let loads: Vec<f64> = candidates.iter().map(|c| c.load).collect();
                let strategy = SelectionStrategy::from_load_balancing(self.config.load_balancing);
                select_agent(&loads, strategy).ok_or_else(|| {
                    DroverError::NoAvailableAgent(format!("no '{agent_type}' agent selected"))
                })?
            }
        };
        let candidate = candidates.swap_remove(idx);

        let task_type = spec.task_type.clone();
        let task_id = candidate.agent.submit_task(spec)?;

        self.record_assignment(TaskAssignmentRecord {
            task_id,
            agent_id: candidate.agent_id.clone(),
            agent_type: agent_type.to_string(),
            task_type,
            fingerprint,
            assigned_at: Utc::now(),
        });
        info!(
            agent_id = %candidate.agent_id,
            agent_type = %agent_type,
            task_id = %task_id,
            load = candidate.load,
            "Task dispatched"
        );
        self.events.emit(OrchestratorEvent::TaskDispatched {
            agent_id: candidate.agent_id.clone(),
            agent_type: agent_type.to_string(),
            task_id,
        });
        Ok((
            TaskAssignment {
                agent_id: candidate.agent_id,
                task_id,
            },
            candidate.agent,
        ))
    }

    pub async fn get_task(&self, agent_id: &str, task_id: Uuid) -> DroverResult<Task> {
        let agent = self
            .agent(agent_id)
            .await
            .ok_or_else(|| DroverError::NotFound(format!("agent {agent_id}")))?;
        agent
            .get_task(task_id)
            .ok_or_else(|| DroverError::NotFound(format!("task {task_id} on agent {agent_id}")))
    }

    pub async fn cancel_task(&self, agent_id: &str, task_id: Uuid) -> DroverResult<bool> {
        let agent = self
            .agent(agent_id)
            .await
            .ok_or_else(|| DroverError::NotFound(format!("agent {agent_id}")))?;
        Ok(agent.cancel_task(task_id))
    }

    fn record_assignment(&self, record: TaskAssignmentRecord) {
        let Some(detector) = self.collision.clone() else {
            return;
        };
        tokio::spawn(async move {
            let task_id = record.task_id;
            if let Err(e) = detector
                .record_task_assignment(record)
                .await
                .map_err(|e| collaborator_error("record_task_assignment", e))
            {
                warn!(task_id = %task_id, error = %e, "Failed to record task assignment");
            }
        });
    }

    fn record_completion(&self, record: TaskCompletionRecord) {
        let Some(detector) = self.collision.clone() else {
            return;
        };
        tokio::spawn(async move {
            let task_id = record.task_id;
            if let Err(e) = detector
                .record_task_completion(record)
                .await
                .map_err(|e| collaborator_error("record_task_completion", e))
            {
                warn!(task_id = %task_id, error = %e, "Failed to record task completion");
            }
        });
    }

    // --- Workflows ---

    /// Validate and start a workflow. Returns immediately; progress is
    /// visible through [`get_workflow_status`] and workflow events.
    ///
    /// [`get_workflow_status`]: Orchestrator::get_workflow_status
    pub async fn execute_workflow(&self, definition: WorkflowDefinition) -> DroverResult<Uuid> {
        definition.validate()?;
        let workflow = Workflow::new(definition);
        let workflow_id = workflow.id;
        info!(
            workflow_id = %workflow_id,
            name = %workflow.name,
            kind = ?workflow.kind,
            steps = workflow.tasks.len(),
            "Workflow accepted"
        );
        self.workflows.write().await.insert(workflow_id, workflow);

        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.drive_workflow(workflow_id).await });
        Ok(workflow_id)
    }

    pub async fn get_workflow_status(&self, workflow_id: Uuid) -> Option<Workflow> {
        self.workflows.read().await.get(&workflow_id).cloned()
    }

    /// All tracked workflows, oldest first.
    pub async fn list_workflows(&self) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> = self.workflows.read().await.values().cloned().collect();
        workflows.sort_by_key(|w| w.created_at);
        workflows
    }

    /// Drop terminal workflows older than `workflow_retention`.
    pub async fn evict_workflows(&self, now: DateTime<Utc>) -> usize {
        let retention = self.config.workflow_retention();
        let mut workflows = self.workflows.write().await;
        let before = workflows.len();
        workflows.retain(|_, w| !w.is_expired(retention, now));
        before - workflows.len()
    }

    async fn drive_workflow(&self, workflow_id: Uuid) {
        let run = {
            let mut workflows = self.workflows.write().await;
            let Some(workflow) = workflows.get_mut(&workflow_id) else {
                return;
            };
            workflow.status = WorkflowStatus::InProgress;
            workflow.started_at = Some(Utc::now());
            WorkflowRun {
                workflow_id,
                name: workflow.name.clone(),
                kind: workflow.kind,
                tasks: workflow.tasks.clone(),
                context: workflow.context.clone(),
                priority: workflow.priority,
            }
        };
        self.events
            .emit(OrchestratorEvent::WorkflowStarted { workflow_id });

        match run.kind {
            WorkflowKind::Sequential => self.run_sequential(&run).await,
            WorkflowKind::Parallel => self.run_parallel(Arc::new(run)).await,
        }
    }

    async fn run_sequential(&self, run: &WorkflowRun) {
        for index in 0..run.tasks.len() {
            match self.run_step(run, index).await {
                Ok(result) => self.record_step(run.workflow_id, result).await,
                Err(e) => {
                    let label = run.tasks[index].label(index);
                    self.finish_workflow(run.workflow_id, Some(format!("step {label} failed: {e}")))
                        .await;
                    return;
                }
            }
        }
        self.finish_workflow(run.workflow_id, None).await;
    }

    /// Every step starts at once and waits only on its own dependencies.
    /// The workflow fails at the first step failure, but steps already
    /// running are left alone and their results are still recorded.
    async fn run_parallel(&self, run: Arc<WorkflowRun>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..run.tasks.len())
            .map(|_| watch::channel(StepState::Waiting))
            .unzip();
        let index_of: HashMap<&str, usize> = run
            .tasks
            .iter()
            .enumerate()
            .filter_map(|(idx, task)| task.id.as_deref().map(|id| (id, idx)))
            .collect();

        let mut steps = JoinSet::new();
        for (index, done) in senders.into_iter().enumerate() {
            let waits: Vec<(String, watch::Receiver<StepState>)> = run.tasks[index]
                .dependencies
                .iter()
                .filter_map(|dep| {
                    index_of
                        .get(dep.as_str())
                        .map(|&dep_idx| (dep.clone(), receivers[dep_idx].clone()))
                })
                .collect();
            let orchestrator = self.clone();
            let step_run = Arc::clone(&run);
            steps.spawn(async move {
                for (dep, mut rx) in waits {
                    // A dropped sender means the dependency's driver died.
                    let state = rx
                        .wait_for(|s| *s != StepState::Waiting)
                        .await
                        .map(|s| *s)
                        .unwrap_or(StepState::Failed);
                    if state == StepState::Failed {
                        let _ = done.send(StepState::Failed);
                        return (
                            index,
                            Err(DroverError::Workflow(format!("dependency '{dep}' failed"))),
                        );
                    }
                }
                let outcome = orchestrator.run_step(&step_run, index).await;
                let state = if outcome.is_ok() {
                    StepState::Succeeded
                } else {
                    StepState::Failed
                };
                let _ = done.send(state);
                (index, outcome)
            });
        }

        let mut failed = false;
        while let Some(joined) = steps.join_next().await {
            let failure = match joined {
                Ok((_, Ok(result))) => {
                    self.record_step(run.workflow_id, result).await;
                    continue;
                }
                Ok((index, Err(e))) => {
                    format!("step {} failed: {e}", run.tasks[index].label(index))
                }
                Err(e) => format!("step driver panicked: {e}"),
            };
            if failed {
                warn!(workflow_id = %run.workflow_id, error = %failure, "Additional workflow step failed");
            } else {
                failed = true;
                self.finish_workflow(run.workflow_id, Some(failure)).await;
            }
        }
        if !failed {
            self.finish_workflow(run.workflow_id, None).await;
        }
    }

    async fn run_step(&self, run: &WorkflowRun, index: usize) -> DroverResult<WorkflowTaskResult> {
        let def = &run.tasks[index];
        let description = def
            .description
            .clone()
            .unwrap_or_else(|| format!("{}: {}", run.name, def.task_type));
        let mut spec = TaskSpec::new(def.task_type.as_str())
            .with_description(description)
            .with_input(def.input.clone())
            .with_context(run.context.clone())
            .with_priority(run.priority);
        if let Some(max_retries) = def.max_retries {
            spec = spec.with_max_retries(max_retries);
        }

        let (assignment, agent) = self.dispatch(&def.agent_type, spec).await?;
        debug!(
            workflow_id = %run.workflow_id,
            step = %def.label(index),
            agent_id = %assignment.agent_id,
            task_id = %assignment.task_id,
            "Workflow step dispatched"
        );
        let timeout = def
            .timeout()
            .unwrap_or_else(|| self.config.default_task_timeout());
        let result = self.await_task(&agent, assignment.task_id, timeout).await?;

        Ok(WorkflowTaskResult {
            index,
            step_id: def.id.clone(),
            agent_id: assignment.agent_id,
            task_id: assignment.task_id,
            task_type: def.task_type.clone(),
            result,
        })
    }

    /// Poll until the task is terminal or `timeout` elapses. A timed-out
    /// task is cancelled on its agent.
    async fn await_task(
        &self,
        agent: &Agent,
        task_id: Uuid,
        timeout: Duration,
    ) -> DroverResult<serde_json::Value> {
        let poll_interval = self.config.poll_interval();
        let poll = async {
            loop {
                let task = agent.get_task(task_id).ok_or_else(|| {
                    DroverError::NotFound(format!("task {task_id} on agent {}", agent.id()))
                })?;
                match task.status {
                    TaskStatus::Completed => {
                        return Ok(task.result.unwrap_or(serde_json::Value::Null))
                    }
                    TaskStatus::Failed => {
                        return Err(DroverError::TaskExecution(
                            task.error.unwrap_or_else(|| format!("task {task_id} failed")),
                        ))
                    }
                    TaskStatus::Cancelled => {
                        return Err(DroverError::TaskExecution(format!(
                            "task {task_id} was cancelled"
                        )))
                    }
                    TaskStatus::Pending | TaskStatus::InProgress => {}
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(agent_id = %agent.id(), task_id = %task_id, timeout_ms, "Task timed out");
                agent.cancel_task(task_id);
                Err(DroverError::TaskTimeout {
                    task_id: task_id.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    async fn record_step(&self, workflow_id: Uuid, result: WorkflowTaskResult) {
        debug!(
            workflow_id = %workflow_id,
            index = result.index,
            task_id = %result.task_id,
            "Workflow step completed"
        );
        if let Some(workflow) = self.workflows.write().await.get_mut(&workflow_id) {
            workflow.results.push(result);
        }
    }

    async fn finish_workflow(&self, workflow_id: Uuid, failure: Option<String>) {
        {
            let mut workflows = self.workflows.write().await;
            let Some(workflow) = workflows.get_mut(&workflow_id) else {
                return;
            };
            if workflow.is_terminal() {
                return;
            }
            workflow.completed_at = Some(Utc::now());
            match &failure {
                None => {
                    workflow.status = WorkflowStatus::Completed;
                    info!(
                        workflow_id = %workflow_id,
                        name = %workflow.name,
                        results = workflow.results.len(),
                        "Workflow completed"
                    );
                }
                Some(reason) => {
                    workflow.status = WorkflowStatus::Failed;
                    workflow.error = Some(reason.clone());
                    error!(
                        workflow_id = %workflow_id,
                        name = %workflow.name,
                        error = %reason,
                        "Workflow failed"
                    );
                }
            }
        }
        let event = match failure {
            None => OrchestratorEvent::WorkflowCompleted { workflow_id },
            Some(error) => OrchestratorEvent::WorkflowFailed { workflow_id, error },
        };
        self.events.emit(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::executor::TaskExecutor;
    use crate::types::CapabilityDescriptor;
    use crate::workflow::TaskDefinition;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn execute(
            &self,
            task: &Task,
            _cancel: CancellationToken,
        ) -> DroverResult<serde_json::Value> {
            Ok(task.input.clone())
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            max_agents: 3,
            poll_interval_ms: 5,
            default_task_timeout_ms: 2_000,
            ..OrchestratorConfig::default()
        }
    }

    fn agent(id: &str) -> Arc<Agent> {
        let config = AgentConfig::new(id)
            .with_id(id)
            .with_capability(CapabilityDescriptor::new("echo"))
            .with_tick_interval(Duration::from_millis(5));
        Agent::new(config, Arc::new(Echo)).unwrap()
    }

    async fn wait_for_workflow(orch: &Orchestrator, id: Uuid) -> Workflow {
        for _ in 0..400 {
            let workflow = orch.get_workflow_status(id).await.unwrap();
            if workflow.is_terminal() {
                return workflow;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workflow {id} did not finish");
    }

    #[tokio::test]
    async fn test_register_starts_agent() {
        let orch = Orchestrator::new(config()).unwrap();
        let a = agent("a1");
        let id = orch.register_agent(Arc::clone(&a), "worker").await.unwrap();
        assert_eq!(id, "a1");
        assert!(a.is_running());
        let agents = orch.list_agents().await;
        assert_eq!(agents[0].agent_type, "worker");
        assert_eq!(agents[0].status, AgentStatus::Active);
        orch.stop().await.unwrap();
        assert!(!a.is_running());
        assert_eq!(orch.agent_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_capacity() {
        let orch = Orchestrator::new(config()).unwrap();
        orch.register_agent(agent("a1"), "worker").await.unwrap();
        assert!(matches!(
            orch.register_agent(agent("a1"), "worker").await,
            Err(DroverError::DuplicateAgent(id)) if id == "a1"
        ));
        orch.register_agent(agent("a2"), "worker").await.unwrap();
        orch.register_agent(agent("a3"), "worker").await.unwrap();
        assert!(matches!(
            orch.register_agent(agent("a4"), "worker").await,
            Err(DroverError::CapacityExceeded(_))
        ));
        orch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_not_found() {
        let orch = Orchestrator::new(config()).unwrap();
        assert!(matches!(
            orch.unregister_agent("ghost").await,
            Err(DroverError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_without_agents() {
        let orch = Orchestrator::new(config()).unwrap();
        let err = orch
            .submit_task("worker", TaskSpec::new("echo"))
            .await
            .unwrap_err();
        assert!(matches!(err, DroverError::NoAvailableAgent(_)));
    }

    #[tokio::test]
    async fn test_submit_and_fetch_task() {
        let orch = Orchestrator::new(config()).unwrap();
        orch.register_agent(agent("a1"), "worker").await.unwrap();
        let assignment = orch
            .submit_task("worker", TaskSpec::new("echo").with_input(serde_json::json!(7)))
            .await
            .unwrap();
        assert_eq!(assignment.agent_id, "a1");

        for _ in 0..200 {
            let task = orch.get_task("a1", assignment.task_id).await.unwrap();
            if task.status == TaskStatus::Completed {
                assert_eq!(task.result, Some(serde_json::json!(7)));
                orch.stop().await.unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never completed");
    }

    #[tokio::test]
    async fn test_route_to_unknown_agent() {
        let orch = Orchestrator::new(config()).unwrap();
        let mut events = orch.subscribe();
        let msg = AgentMessage::new("a1", "nobody", drover_core::MessageKind::Coordination, serde_json::Value::Null);
        let err = orch.route_message(msg).await.unwrap_err();
        assert!(matches!(err, DroverError::Routing(_)));
        match events.recv().await.unwrap() {
            OrchestratorEvent::RoutingFailure { to, .. } => assert_eq!(to, "nobody"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sequential_workflow_runs_in_order() {
        let orch = Orchestrator::new(config()).unwrap();
        orch.register_agent(agent("a1"), "worker").await.unwrap();
        let def = WorkflowDefinition::sequential(
            "count",
            (1..=3)
                .map(|n| TaskDefinition::new("worker", "echo").with_input(serde_json::json!(n)))
                .collect(),
        );
        let id = orch.execute_workflow(def).await.unwrap();
        let workflow = wait_for_workflow(&orch, id).await;
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        let outputs: Vec<_> = workflow.results.iter().map(|r| r.result.clone()).collect();
        assert_eq!(outputs, vec![serde_json::json!(1), serde_json::json!(2), serde_json::json!(3)]);
        assert!(workflow.started_at.is_some() && workflow.completed_at.is_some());
        orch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_workflow_rejected_up_front() {
        let orch = Orchestrator::new(config()).unwrap();
        let def = WorkflowDefinition::parallel("empty", vec![]);
        assert!(matches!(
            orch.execute_workflow(def).await,
            Err(DroverError::Workflow(_))
        ));
        assert!(orch.list_workflows().await.is_empty());
    }

    #[tokio::test]
    async fn test_workflow_eviction() {
        let orch = Orchestrator::new(OrchestratorConfig {
            workflow_retention_ms: 0,
            ..config()
        })
        .unwrap();
        orch.register_agent(agent("a1"), "worker").await.unwrap();
        let id = orch
            .execute_workflow(WorkflowDefinition::sequential(
                "once",
                vec![TaskDefinition::new("worker", "echo")],
            ))
            .await
            .unwrap();
        wait_for_workflow(&orch, id).await;

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(orch.evict_workflows(later).await, 1);
        assert!(orch.get_workflow_status(id).await.is_none());
        orch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let orch = Orchestrator::new(config()).unwrap();
        orch.start();
        orch.start();
        assert!(orch.is_running());
        orch.stop().await.unwrap();
        assert!(!orch.is_running());
    }
}
