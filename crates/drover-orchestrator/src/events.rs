use crate::types::{AgentStatus, Task};
use drover_core::AgentMessage;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Notifications emitted by an [`crate::Agent`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Started {
        agent_id: String,
    },
    Stopped {
        agent_id: String,
    },
    TaskSubmitted {
        agent_id: String,
        task_id: Uuid,
        task_type: String,
    },
    TaskStarted {
        agent_id: String,
        task_id: Uuid,
    },
    TaskCompleted {
        agent_id: String,
        task: Task,
    },
    TaskRetrying {
        agent_id: String,
        task_id: Uuid,
        retry_count: u32,
        error: String,
    },
    TaskFailed {
        agent_id: String,
        task: Task,
    },
    TaskCancelled {
        agent_id: String,
        task_id: Uuid,
    },
    /// The agent wants this message delivered; the orchestrator routes it.
    Outbound {
        message: AgentMessage,
    },
    MessageHandlerError {
        agent_id: String,
        message_id: Uuid,
        error: String,
    },
    /// Something went wrong outside the normal task error path, e.g. an
    /// executor panic. Triggers a restart when the agent is registered.
    Error {
        agent_id: String,
        error: String,
    },
}

/// Notifications emitted by the [`crate::Orchestrator`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    AgentRegistered {
        agent_id: String,
        agent_type: String,
    },
    AgentUnregistered {
        agent_id: String,
    },
    AgentStatusChanged {
        agent_id: String,
        from: AgentStatus,
        to: AgentStatus,
    },
    AgentRestarted {
        agent_id: String,
    },
    AgentRestartFailed {
        agent_id: String,
        error: String,
    },
    RoutingFailure {
        message_id: Uuid,
        from: String,
        to: String,
    },
    TaskDispatched {
        agent_id: String,
        agent_type: String,
        task_id: Uuid,
    },
    WorkflowStarted {
        workflow_id: Uuid,
    },
    WorkflowCompleted {
        workflow_id: Uuid,
    },
    WorkflowFailed {
        workflow_id: Uuid,
        error: String,
    },
    /// An event relayed from a registered agent.
    Agent {
        event: AgentEvent,
    },
}

/// Fan-out of events to any number of subscribers.
///
/// Each subscriber gets its own unbounded channel; closed subscribers are
/// dropped on the next emit.
pub struct EventHub<E> {
    listeners: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone> EventHub<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: E) {
        self.listeners
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl<E: Clone> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let hub: EventHub<u32> = EventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.emit(7);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_closed_subscribers_pruned() {
        let hub: EventHub<u32> = EventHub::new();
        let rx = hub.subscribe();
        let mut keep = hub.subscribe();
        drop(rx);
        hub.emit(1);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(keep.recv().await, Some(1));
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = AgentEvent::TaskCancelled {
            agent_id: "a1".into(),
            task_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task_cancelled");
        assert_eq!(json["agent_id"], "a1");
    }
}
