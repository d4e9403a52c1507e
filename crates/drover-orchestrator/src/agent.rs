use crate::config::AgentConfig;
use crate::events::{AgentEvent, EventHub};
use crate::executor::TaskExecutor;
use crate::task_queue::{FailureOutcome, TaskQueue};
use crate::types::{AgentMetrics, AgentStats, Task, TaskFilter, TaskSpec, TaskStatus};
use chrono::{DateTime, Utc};
use drover_core::{AgentMessage, DroverError, DroverResult, MessageKind};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often `stop` re-checks for in-progress tasks while draining.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Mutable state guarded by a single lock. Never held across an await.
struct AgentState {
    tasks: TaskQueue,
    inbox: VecDeque<AgentMessage>,
    /// Cancellation handles for attempts currently executing.
    running: HashMap<Uuid, CancellationToken>,
    metrics: AgentMetrics,
    last_activity: DateTime<Utc>,
    started_at: Option<Instant>,
}

struct LoopHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// A worker with a bounded task queue, a capability set, and a fixed-interval
/// processing loop.
///
/// Admission is bounded by `max_concurrent_tasks`, but execution is serialized:
/// each tick advances pending tasks one at a time. Run several agents of the
/// same type behind the orchestrator for parallelism.
pub struct Agent {
    id: String,
    config: AgentConfig,
    executor: Arc<dyn TaskExecutor>,
    state: Mutex<AgentState>,
    events: EventHub<AgentEvent>,
    runtime: Mutex<Option<LoopHandle>>,
    stopping: AtomicBool,
    /// Serializes ticks, so a manual `process_tick` never overlaps the loop.
    tick_lock: tokio::sync::Mutex<()>,
}

impl Agent {
    /// Create an agent. The id comes from the config or is derived from the
    /// agent name.
    pub fn new(config: AgentConfig, executor: Arc<dyn TaskExecutor>) -> DroverResult<Arc<Self>> {
        config.validate()?;
        let id = config.id.clone().unwrap_or_else(|| {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("{}-{}", config.name, &suffix[..8])
        });
        Ok(Arc::new(Self {
            id,
            config,
            executor,
            state: Mutex::new(AgentState {
                tasks: TaskQueue::new(),
                inbox: VecDeque::new(),
                running: HashMap::new(),
                metrics: AgentMetrics::default(),
                last_activity: Utc::now(),
                started_at: None,
            }),
            events: EventHub::new(),
            runtime: Mutex::new(None),
            stopping: AtomicBool::new(false),
            tick_lock: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn capability_names(&self) -> Vec<String> {
        self.config
            .capabilities
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Whether any declared capability accepts this task type.
    pub fn supports(&self, task_type: &str) -> bool {
        self.config
            .capabilities
            .iter()
            .any(|c| c.supports(task_type))
    }

    /// Subscribe to this agent's events.
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    // --- Lifecycle ---

    /// Start the processing loop. Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> DroverResult<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Err(DroverError::Agent(format!(
                "agent {} is already running",
                self.id
            )));
        }
        self.stopping.store(false, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            state.started_at = Some(Instant::now());
            state.last_activity = Utc::now();
        }

        let shutdown = CancellationToken::new();
        let agent = Arc::clone(self);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { agent.run_loop(token).await });
        *runtime = Some(LoopHandle { shutdown, handle });
        drop(runtime);

        info!(agent_id = %self.id, name = %self.config.name, "Agent started");
        self.events.emit(AgentEvent::Started {
            agent_id: self.id.clone(),
        });
        Ok(())
    }

    /// Stop the loop and drain.
    ///
    /// No new ticks are scheduled and no further pending tasks are started.
    /// In-progress tasks get up to `shutdown_timeout` to finish; whatever is
    /// still running after that is cancelled. Queued inbound messages are
    /// discarded. Stopping an agent that is not running is a no-op.
    pub async fn stop(&self) -> DroverResult<()> {
        let Some(runtime) = self.runtime.lock().take() else {
            return Ok(());
        };
        self.stopping.store(true, Ordering::SeqCst);
        runtime.shutdown.cancel();

        let deadline = Instant::now() + self.config.shutdown_timeout();
        let mut forced = Vec::new();
        loop {
            let busy = self.state.lock().tasks.count(TaskStatus::InProgress);
            if busy == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                forced = self.force_cancel_in_progress();
                break;
            }
            tokio::time::sleep(DRAIN_POLL.min(deadline - now)).await;
        }

        // A tick may have started one last attempt right before the flag was
        // seen; give the loop the rest of the budget, then cut it off.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut handle = runtime.handle;
        let exited =
            forced.is_empty() && tokio::time::timeout(remaining, &mut handle).await.is_ok();
        if !exited {
            handle.abort();
            forced.extend(self.force_cancel_in_progress());
        }

        let dropped = {
            let mut state = self.state.lock();
            state.started_at = None;
            let dropped = state.inbox.len();
            state.inbox.clear();
            dropped
        };
        if dropped > 0 {
            warn!(agent_id = %self.id, dropped, "Discarded unprocessed messages on stop");
        }
        for task_id in forced {
            warn!(agent_id = %self.id, task_id = %task_id, "Task force-cancelled on shutdown");
            self.events.emit(AgentEvent::TaskCancelled {
                agent_id: self.id.clone(),
                task_id,
            });
        }

        let cleanup = self.executor.cleanup().await;
        info!(agent_id = %self.id, "Agent stopped");
        self.events.emit(AgentEvent::Stopped {
            agent_id: self.id.clone(),
        });
        cleanup
    }

    fn force_cancel_in_progress(&self) -> Vec<Uuid> {
        let mut state = self.state.lock();
        let ids = state.tasks.cancel_in_progress();
        for id in &ids {
            if let Some(token) = state.running.remove(id) {
                token.cancel();
            }
        }
        state.metrics.cancelled += ids.len() as u64;
        ids
    }

    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.process_tick().await,
            }
        }
        debug!(agent_id = %self.id, "Processing loop exited");
    }

    // --- Tasks ---

    /// Queue a task. Fails if the agent is at capacity or no capability
    /// matches the task type; in both cases the task map is untouched.
    pub fn submit_task(&self, spec: TaskSpec) -> DroverResult<Uuid> {
        let task = {
            let mut state = self.state.lock();
            let in_flight = state.tasks.in_flight_count();
            if in_flight >= self.config.max_concurrent_tasks {
                return Err(DroverError::CapacityExceeded(format!(
                    "agent {} is at capacity ({in_flight}/{})",
                    self.id, self.config.max_concurrent_tasks
                )));
            }
            if !self.supports(&spec.task_type) {
                return Err(DroverError::UnsupportedTaskType(format!(
                    "agent {} cannot handle '{}'",
                    self.id, spec.task_type
                )));
            }
            let task = Task::from_spec(spec, self.config.default_max_retries);
            state.tasks.add(task.clone());
            state.last_activity = Utc::now();
            task
        };

        debug!(agent_id = %self.id, task_id = %task.id, task_type = %task.task_type, "Task submitted");
        self.events.emit(AgentEvent::TaskSubmitted {
            agent_id: self.id.clone(),
            task_id: task.id,
            task_type: task.task_type,
        });
        Ok(task.id)
    }

    pub fn get_task(&self, id: Uuid) -> Option<Task> {
        self.state.lock().tasks.get(id).cloned()
    }

    /// Tasks matching the filter, in submission order.
    pub fn get_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.state
            .lock()
            .tasks
            .filter(filter)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Cancel a task that has not reached a terminal state.
    ///
    /// A pending task will never start. An in-progress task has its
    /// cancellation token fired; its eventual result is discarded.
    pub fn cancel_task(&self, id: Uuid) -> bool {
        let cancelled = {
            let mut state = self.state.lock();
            if state.tasks.cancel(id) {
                if let Some(token) = state.running.remove(&id) {
                    token.cancel();
                }
                state.metrics.cancelled += 1;
                true
            } else {
                false
            }
        };
        if cancelled {
            info!(agent_id = %self.id, task_id = %id, "Task cancelled");
            self.events.emit(AgentEvent::TaskCancelled {
                agent_id: self.id.clone(),
                task_id: id,
            });
        }
        cancelled
    }

    // --- Messages ---

    /// Hand a message to the router. Fails if nothing is listening.
    pub fn send_message(&self, message: AgentMessage) -> DroverResult<()> {
        if self.events.subscriber_count() == 0 {
            return Err(DroverError::Routing(format!(
                "agent {} has no router attached",
                self.id
            )));
        }
        debug!(agent_id = %self.id, to = %message.to, kind = ?message.kind, "Sending message");
        self.events.emit(AgentEvent::Outbound { message });
        Ok(())
    }

    /// Queue an inbound message; it is processed on the next tick.
    pub fn receive_message(&self, message: AgentMessage) {
        self.state.lock().inbox.push_back(message);
    }

    // --- Stats ---

    /// In-flight tasks divided by `max_concurrent_tasks`.
    pub fn current_load(&self) -> f64 {
        self.state.lock().tasks.in_flight_count() as f64 / self.config.max_concurrent_tasks as f64
    }

    pub fn get_stats(&self) -> AgentStats {
        let running = self.is_running();
        let state = self.state.lock();
        let m = &state.metrics;
        let finished = m.succeeded + m.failed;
        let success_rate = if finished == 0 {
            0.0
        } else {
            m.succeeded as f64 / finished as f64
        };
        let average_execution_ms = if m.succeeded == 0 {
            0.0
        } else {
            m.total_execution_ms as f64 / m.succeeded as f64
        };
        AgentStats {
            agent_id: self.id.clone(),
            name: self.config.name.clone(),
            total_tasks: state.tasks.total_count(),
            pending: state.tasks.count(TaskStatus::Pending),
            in_progress: state.tasks.count(TaskStatus::InProgress),
            completed: state.tasks.count(TaskStatus::Completed),
            failed: state.tasks.count(TaskStatus::Failed),
            cancelled: state.tasks.count(TaskStatus::Cancelled),
            success_rate,
            average_execution_ms,
            current_load: state.tasks.in_flight_count() as f64
                / self.config.max_concurrent_tasks as f64,
            capabilities: self.capability_names(),
            uptime_ms: state
                .started_at
                .map(|s| u64::try_from(s.elapsed().as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0),
            last_activity: state.last_activity,
            running,
            queued_messages: state.inbox.len(),
            metrics: m.clone(),
        }
    }

    // --- Processing ---

    /// One iteration of the processing loop: drain inbound messages, advance
    /// every pending task once, then evict expired terminal tasks.
    ///
    /// The loop calls this on every tick; it can also be called directly to
    /// drive an agent that was never started.
    pub async fn process_tick(&self) {
        let _guard = self.tick_lock.lock().await;

        let inbox: Vec<AgentMessage> = self.state.lock().inbox.drain(..).collect();
        for message in inbox {
            self.handle_inbound(message).await;
        }

        let pending = self.state.lock().tasks.pending_ids();
        for task_id in pending {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            self.run_attempt(task_id).await;
        }

        let evicted = self
            .state
            .lock()
            .tasks
            .evict_terminal(self.config.task_retention(), Utc::now());
        if evicted > 0 {
            debug!(agent_id = %self.id, evicted, "Evicted expired tasks");
        }
    }

    async fn run_attempt(&self, task_id: Uuid) {
        let (task, token) = {
            let mut state = self.state.lock();
            // Cancelled or already picked up since the pending list was taken
            let Some(task) = state.tasks.mark_in_progress(task_id) else {
                return;
            };
            let token = CancellationToken::new();
            state.running.insert(task_id, token.clone());
            state.metrics.attempts += 1;
            state.last_activity = Utc::now();
            (task, token)
        };

        info!(
            agent_id = %self.id,
            task_id = %task_id,
            task_type = %task.task_type,
            attempt = task.retry_count + 1,
            "Executing task"
        );
        self.events.emit(AgentEvent::TaskStarted {
            agent_id: self.id.clone(),
            task_id,
        });

        // Separate tokio task so a panicking executor cannot take the loop down.
        let executor = Arc::clone(&self.executor);
        let outcome = tokio::spawn(async move { executor.execute(&task, token).await }).await;

        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            state.running.remove(&task_id);
            state.last_activity = Utc::now();

            match outcome {
                Ok(Ok(value)) => {
                    if state.tasks.mark_completed(task_id, value) {
                        let done = state.tasks.get(task_id).cloned();
                        state.metrics.succeeded += 1;
                        if let Some(done) = done {
                            state.metrics.total_execution_ms += done.execution_ms().unwrap_or(0);
                            info!(agent_id = %self.id, task_id = %task_id, "Task completed");
                            events.push(AgentEvent::TaskCompleted {
                                agent_id: self.id.clone(),
                                task: done,
                            });
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.apply_failure(&mut state, task_id, e.to_string(), &mut events);
                }
                Err(join_error) => {
                    let reason = if join_error.is_panic() {
                        "executor panicked"
                    } else {
                        "executor was aborted"
                    };
                    error!(agent_id = %self.id, task_id = %task_id, "{reason}");
                    state.metrics.errors += 1;
                    self.apply_failure(&mut state, task_id, reason.to_string(), &mut events);
                    events.push(AgentEvent::Error {
                        agent_id: self.id.clone(),
                        error: format!("{reason} while running task {task_id}"),
                    });
                }
            }
        }

        for event in events {
            self.events.emit(event);
        }
    }

    fn apply_failure(
        &self,
        state: &mut AgentState,
        task_id: Uuid,
        error: String,
        events: &mut Vec<AgentEvent>,
    ) {
        match state.tasks.record_failure(task_id, error.clone()) {
            Some(FailureOutcome::Retrying { retry_count }) => {
                state.metrics.retries += 1;
                warn!(
                    agent_id = %self.id,
                    task_id = %task_id,
                    retry_count,
                    error = %error,
                    "Task attempt failed, retrying"
                );
                events.push(AgentEvent::TaskRetrying {
                    agent_id: self.id.clone(),
                    task_id,
                    retry_count,
                    error,
                });
            }
            Some(FailureOutcome::Failed) => {
                state.metrics.failed += 1;
                error!(agent_id = %self.id, task_id = %task_id, error = %error, "Task failed");
                if let Some(task) = state.tasks.get(task_id).cloned() {
                    events.push(AgentEvent::TaskFailed {
                        agent_id: self.id.clone(),
                        task,
                    });
                }
            }
            // Cancelled while the attempt was running
            None => {}
        }
    }

    async fn handle_inbound(&self, message: AgentMessage) {
        {
            let mut state = self.state.lock();
            state.metrics.messages_processed += 1;
            state.last_activity = Utc::now();
        }

        let reply = match message.kind {
            MessageKind::TaskRequest => Ok(Some(self.answer_task_request(&message))),
            MessageKind::Status if message.correlation_id.is_none() => {
                serde_json::to_value(self.get_stats())
                    .map(|stats| Some(message.reply(MessageKind::Status, stats)))
                    .map_err(DroverError::from)
            }
            _ => self.executor.handle_message(&message).await,
        };

        match reply {
            Ok(Some(reply)) => {
                if let Err(e) = self.send_message(reply) {
                    warn!(agent_id = %self.id, error = %e, "Could not send reply");
                }
            }
            Ok(None) => {}
            Err(e) => self.report_handler_error(message.id, &e),
        }
    }

    /// Submit the task carried by a `task_request` and build the response.
    fn answer_task_request(&self, message: &AgentMessage) -> AgentMessage {
        let submitted = serde_json::from_value::<TaskSpec>(message.payload.clone())
            .map_err(DroverError::from)
            .and_then(|spec| self.submit_task(spec));
        match submitted {
            Ok(task_id) => message.reply(
                MessageKind::TaskResponse,
                serde_json::json!({ "task_id": task_id, "status": "accepted" }),
            ),
            Err(e) => {
                self.report_handler_error(message.id, &e);
                message.reply(
                    MessageKind::Error,
                    serde_json::json!({ "error": e.to_string() }),
                )
            }
        }
    }

    fn report_handler_error(&self, message_id: Uuid, error: &DroverError) {
        warn!(agent_id = %self.id, message_id = %message_id, error = %error, "Message handler failed");
        self.state.lock().metrics.errors += 1;
        self.events.emit(AgentEvent::MessageHandlerError {
            agent_id: self.id.clone(),
            message_id,
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::CapabilityDescriptor;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Echoes the input back, recording the order of task types it saw.
    struct RecordingExecutor {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskExecutor for RecordingExecutor {
        async fn execute(
            &self,
            task: &Task,
            _cancel: CancellationToken,
        ) -> DroverResult<serde_json::Value> {
            self.seen.lock().push(task.task_type.clone());
            Ok(task.input.clone())
        }
    }

    struct FailingExecutor {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskExecutor for FailingExecutor {
        async fn execute(
            &self,
            _task: &Task,
            _cancel: CancellationToken,
        ) -> DroverResult<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DroverError::TaskExecution("always fails".into()))
        }
    }

    /// Runs until cancelled, then reports whether it saw the signal.
    struct WaitForCancel {
        observed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TaskExecutor for WaitForCancel {
        async fn execute(
            &self,
            _task: &Task,
            cancel: CancellationToken,
        ) -> DroverResult<serde_json::Value> {
            cancel.cancelled().await;
            self.observed.store(true, Ordering::SeqCst);
            Err(DroverError::TaskExecution("cancelled".into()))
        }
    }

    struct SleepExecutor {
        duration: Duration,
    }

    #[async_trait]
    impl TaskExecutor for SleepExecutor {
        async fn execute(
            &self,
            _task: &Task,
            _cancel: CancellationToken,
        ) -> DroverResult<serde_json::Value> {
            tokio::time::sleep(self.duration).await;
            Ok(serde_json::json!("slept"))
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl TaskExecutor for PanickingExecutor {
        async fn execute(
            &self,
            _task: &Task,
            _cancel: CancellationToken,
        ) -> DroverResult<serde_json::Value> {
            panic!("executor bug");
        }
    }

    struct RejectingHandler;

    #[async_trait]
    impl TaskExecutor for RejectingHandler {
        async fn execute(
            &self,
            _task: &Task,
            _cancel: CancellationToken,
        ) -> DroverResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        async fn handle_message(
            &self,
            _message: &AgentMessage,
        ) -> DroverResult<Option<AgentMessage>> {
            Err(DroverError::Agent("cannot coordinate".into()))
        }
    }

    fn config() -> AgentConfig {
        AgentConfig::new("worker")
            .with_id("worker-1")
            .with_capability(
                CapabilityDescriptor::new("analyze").with_specializations(vec!["summarize".into()]),
            )
            .with_tick_interval(Duration::from_millis(5))
    }

    fn recording() -> Arc<RecordingExecutor> {
        Arc::new(RecordingExecutor {
            seen: Mutex::new(Vec::new()),
        })
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_generated_id_uses_name() {
        let agent = Agent::new(
            AgentConfig::new("scout").with_capability(CapabilityDescriptor::new("x")),
            recording(),
        )
        .unwrap();
        assert!(agent.id().starts_with("scout-"));
        assert_eq!(agent.name(), "scout");
    }

    #[test]
    fn test_rejects_unsupported_type() {
        let agent = Agent::new(config(), recording()).unwrap();
        let err = agent.submit_task(TaskSpec::new("deploy")).unwrap_err();
        assert!(matches!(err, DroverError::UnsupportedTaskType(_)));
        assert!(agent.get_tasks(&TaskFilter::default()).is_empty());
        // Specialization tags are accepted
        assert!(agent.submit_task(TaskSpec::new("summarize")).is_ok());
    }

    #[test]
    fn test_capacity_leaves_task_map_unchanged() {
        let agent = Agent::new(config().with_max_concurrent_tasks(2), recording()).unwrap();
        agent.submit_task(TaskSpec::new("analyze")).unwrap();
        agent.submit_task(TaskSpec::new("analyze")).unwrap();

        let err = agent.submit_task(TaskSpec::new("analyze")).unwrap_err();
        assert!(matches!(err, DroverError::CapacityExceeded(_)));
        assert_eq!(agent.get_tasks(&TaskFilter::default()).len(), 2);
        assert!((agent.get_stats().current_load - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_tick_completes_task() {
        let agent = Agent::new(config(), recording()).unwrap();
        let id = agent
            .submit_task(TaskSpec::new("analyze").with_input(serde_json::json!({"doc": 1})))
            .unwrap();

        agent.process_tick().await;

        let task = agent.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(serde_json::json!({"doc": 1})));
        assert!(task.error.is_none());
        assert!(task.started_at.unwrap() <= task.completed_at.unwrap());

        let stats = agent.get_stats();
        assert_eq!(stats.completed, 1);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(stats.current_load, 0.0);
    }

    #[tokio::test]
    async fn test_retry_bound_is_max_retries_plus_one() {
        let calls = Arc::new(AtomicUsize::new(0));
        let agent = Agent::new(
            config(),
            Arc::new(FailingExecutor {
                calls: calls.clone(),
            }),
        )
        .unwrap();
        let id = agent
            .submit_task(TaskSpec::new("analyze").with_max_retries(2))
            .unwrap();

        for _ in 0..10 {
            agent.process_tick().await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let task = agent.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert!(task.result.is_none());
        assert!(task.error.as_deref().unwrap().contains("always fails"));
        assert!(task.completed_at.is_some());
        assert_eq!(agent.get_stats().metrics.retries, 2);
    }

    #[tokio::test]
    async fn test_retried_task_waits_for_next_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let agent = Agent::new(
            config(),
            Arc::new(FailingExecutor {
                calls: calls.clone(),
            }),
        )
        .unwrap();
        let id = agent.submit_task(TaskSpec::new("analyze")).unwrap();

        agent.process_tick().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(agent.get_task(id).unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_priority_order_within_tick() {
        let executor = recording();
        let agent = Agent::new(
            config().with_capability(CapabilityDescriptor::new("low")),
            executor.clone(),
        )
        .unwrap();
        agent
            .submit_task(TaskSpec::new("low").with_priority(drover_core::Priority::Low))
            .unwrap();
        agent
            .submit_task(TaskSpec::new("analyze").with_priority(drover_core::Priority::Critical))
            .unwrap();

        agent.process_tick().await;
        assert_eq!(*executor.seen.lock(), vec!["analyze", "low"]);
    }

    #[tokio::test]
    async fn test_cancel_pending_then_again() {
        let executor = recording();
        let agent = Agent::new(config(), executor.clone()).unwrap();
        let id = agent.submit_task(TaskSpec::new("analyze")).unwrap();

        assert!(agent.cancel_task(id));
        assert!(!agent.cancel_task(id));

        agent.process_tick().await;
        assert!(executor.seen.lock().is_empty());
        let task = agent.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_in_progress_fires_token() {
        let observed = Arc::new(AtomicBool::new(false));
        let agent = Agent::new(
            config(),
            Arc::new(WaitForCancel {
                observed: observed.clone(),
            }),
        )
        .unwrap();
        agent.start().unwrap();
        let id = agent.submit_task(TaskSpec::new("analyze")).unwrap();

        wait_until(|| agent.get_task(id).unwrap().status == TaskStatus::InProgress).await;
        assert!(agent.cancel_task(id));
        wait_until(|| observed.load(Ordering::SeqCst)).await;

        // The executor's error after cancellation does not trigger a retry
        tokio::time::sleep(Duration::from_millis(30)).await;
        let task = agent.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.error.is_none());
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cannot_start_twice() {
        let agent = Agent::new(config(), recording()).unwrap();
        agent.start().unwrap();
        assert!(matches!(agent.start(), Err(DroverError::Agent(_))));
        agent.stop().await.unwrap();
        assert!(!agent.is_running());
        // Restart after stop works
        agent.start().unwrap();
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_progress() {
        let agent = Agent::new(
            config(),
            Arc::new(SleepExecutor {
                duration: Duration::from_millis(60),
            }),
        )
        .unwrap();
        agent.start().unwrap();
        let id = agent.submit_task(TaskSpec::new("analyze")).unwrap();
        wait_until(|| agent.get_task(id).unwrap().status == TaskStatus::InProgress).await;

        agent.stop().await.unwrap();
        assert_eq!(agent.get_task(id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_stop_force_cancels_after_timeout() {
        let agent = Agent::new(
            config().with_shutdown_timeout(Duration::from_millis(40)),
            Arc::new(SleepExecutor {
                duration: Duration::from_secs(30),
            }),
        )
        .unwrap();
        agent.start().unwrap();
        let running = agent.submit_task(TaskSpec::new("analyze")).unwrap();
        wait_until(|| agent.get_task(running).unwrap().status == TaskStatus::InProgress).await;
        let queued = agent.submit_task(TaskSpec::new("analyze")).unwrap();

        agent.stop().await.unwrap();
        assert_eq!(
            agent.get_task(running).unwrap().status,
            TaskStatus::Cancelled
        );
        // Never started, stays queued for the next start
        assert_eq!(agent.get_task(queued).unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_panic_is_contained_and_reported() {
        let agent = Agent::new(config(), Arc::new(PanickingExecutor)).unwrap();
        let mut events = agent.subscribe();
        let id = agent
            .submit_task(TaskSpec::new("analyze").with_max_retries(0))
            .unwrap();

        agent.process_tick().await;

        let task = agent.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("executor panicked"));

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let AgentEvent::Error { agent_id, .. } = event {
                assert_eq!(agent_id, "worker-1");
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_task_request_message_gets_response() {
        let agent = Agent::new(config(), recording()).unwrap();
        let mut events = agent.subscribe();
        let request = AgentMessage::new(
            "planner",
            "worker-1",
            MessageKind::TaskRequest,
            serde_json::json!({"type": "analyze", "description": "from a peer"}),
        );
        agent.receive_message(request.clone());

        agent.process_tick().await;

        let mut response = None;
        while let Ok(event) = events.try_recv() {
            if let AgentEvent::Outbound { message } = event {
                response = Some(message);
            }
        }
        let response = response.unwrap();
        assert_eq!(response.kind, MessageKind::TaskResponse);
        assert_eq!(response.to, "planner");
        assert_eq!(response.correlation_id, Some(request.id));

        let task_id: Uuid = serde_json::from_value(response.payload["task_id"].clone()).unwrap();
        // Submitted during message handling, executed in the same tick
        assert_eq!(
            agent.get_task(task_id).unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_bad_task_request_answers_with_error() {
        let agent = Agent::new(config(), recording()).unwrap();
        let mut events = agent.subscribe();
        agent.receive_message(AgentMessage::new(
            "planner",
            "worker-1",
            MessageKind::TaskRequest,
            serde_json::json!({"type": "deploy"}),
        ));

        agent.process_tick().await;

        let mut kinds = Vec::new();
        let mut handler_errors = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                AgentEvent::Outbound { message } => kinds.push(message.kind),
                AgentEvent::MessageHandlerError { .. } => handler_errors += 1,
                _ => {}
            }
        }
        assert_eq!(kinds, vec![MessageKind::Error]);
        assert_eq!(handler_errors, 1);
    }

    #[tokio::test]
    async fn test_status_query_and_answer() {
        let agent = Agent::new(config(), recording()).unwrap();
        let mut events = agent.subscribe();
        let query = AgentMessage::new("ops", "worker-1", MessageKind::Status, serde_json::Value::Null);
        // An answer to an earlier query must not be answered again
        let answer = AgentMessage::new("ops", "worker-1", MessageKind::Status, serde_json::Value::Null)
            .with_correlation(Uuid::new_v4());
        agent.receive_message(query);
        agent.receive_message(answer);

        agent.process_tick().await;

        let replies: Vec<AgentMessage> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                AgentEvent::Outbound { message } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].payload["agent_id"], "worker-1");
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_tick() {
        let agent = Agent::new(config(), Arc::new(RejectingHandler)).unwrap();
        let mut events = agent.subscribe();
        agent.receive_message(AgentMessage::new(
            "peer",
            "worker-1",
            MessageKind::Coordination,
            serde_json::Value::Null,
        ));
        let id = agent.submit_task(TaskSpec::new("analyze")).unwrap();

        agent.process_tick().await;

        assert_eq!(agent.get_task(id).unwrap().status, TaskStatus::Completed);
        let handler_errors = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, AgentEvent::MessageHandlerError { .. }))
            .count();
        assert_eq!(handler_errors, 1);
    }

    #[tokio::test]
    async fn test_send_without_router_fails() {
        let agent = Agent::new(config(), recording()).unwrap();
        let msg = AgentMessage::new("worker-1", "x", MessageKind::Coordination, serde_json::Value::Null);
        assert!(matches!(agent.send_message(msg), Err(DroverError::Routing(_))));
    }

    #[tokio::test]
    async fn test_terminal_tasks_evicted_after_retention() {
        let agent = Agent::new(config().with_task_retention(Duration::ZERO), recording()).unwrap();
        let id = agent.submit_task(TaskSpec::new("analyze")).unwrap();
        agent.process_tick().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        agent.process_tick().await;
        assert!(agent.get_task(id).is_none());
        // Lifetime metrics survive eviction
        assert_eq!(agent.get_stats().metrics.succeeded, 1);
    }

    #[tokio::test]
    async fn test_running_loop_processes_tasks() {
        let agent = Agent::new(config(), recording()).unwrap();
        agent.start().unwrap();
        let id = agent.submit_task(TaskSpec::new("analyze")).unwrap();
        wait_until(|| agent.get_task(id).unwrap().status == TaskStatus::Completed).await;
        assert!(agent.get_stats().running);
        agent.stop().await.unwrap();
        assert!(!agent.get_stats().running);
    }
}
