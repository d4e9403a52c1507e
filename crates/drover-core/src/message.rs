use crate::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What an [`AgentMessage`] is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Ask the receiver to run a task; the payload is a task spec.
    TaskRequest,
    /// Answer to a `TaskRequest`.
    TaskResponse,
    /// Free-form coordination between agents.
    Coordination,
    /// Status query, or the answer to one.
    Status,
    /// Error report.
    Error,
}

/// A message sent from one agent to another, routed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// Identifier of the sending agent.
    pub from: String,
    /// Identifier of the destination agent.
    pub to: String,
    /// The message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Opaque payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Id of the message this one answers, if any.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// Delivery priority (informational; delivery is FIFO per receiver).
    #[serde(default)]
    pub priority: Priority,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    /// Creates a new message with a fresh id and medium priority.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to: to.into(),
            kind,
            payload,
            correlation_id: None,
            priority: Priority::default(),
            timestamp: Utc::now(),
        }
    }

    /// Sets the correlation id.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builds a reply addressed back to the sender, correlated to this message.
    pub fn reply(&self, kind: MessageKind, payload: serde_json::Value) -> Self {
        AgentMessage::new(self.to.clone(), self.from.clone(), kind, payload)
            .with_correlation(self.id)
            .with_priority(self.priority)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_swaps_endpoints() {
        let req = AgentMessage::new("a", "b", MessageKind::Status, serde_json::Value::Null)
            .with_priority(Priority::High);
        let reply = req.reply(MessageKind::Status, serde_json::json!({"ok": true}));
        assert_eq!(reply.from, "b");
        assert_eq!(reply.to, "a");
        assert_eq!(reply.correlation_id, Some(req.id));
        assert_eq!(reply.priority, Priority::High);
        assert_ne!(reply.id, req.id);
    }

    #[test]
    fn test_kind_serialized_as_type_field() {
        let msg = AgentMessage::new("a", "b", MessageKind::TaskRequest, serde_json::Value::Null);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "task_request");
        assert!(json.get("kind").is_none());
    }
}
