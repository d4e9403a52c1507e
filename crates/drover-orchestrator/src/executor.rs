use crate::types::Task;
use async_trait::async_trait;
use drover_core::{AgentMessage, DroverResult};
use tokio_util::sync::CancellationToken;

/// The work an agent actually performs, supplied per concrete agent kind.
///
/// The agent owns lifecycle, retries, and bookkeeping; implementations only
/// turn a task into a result. `cancel` fires when the task is cancelled or the
/// agent is force-stopped. Long-running implementations should check it at
/// their I/O boundaries; nothing interrupts an executor that ignores it.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one attempt of `task`.
    async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> DroverResult<serde_json::Value>;

    /// Handle an inbound `coordination`, `task_response`, or `error` message.
    /// A returned message is routed as a reply.
    async fn handle_message(&self, _message: &AgentMessage) -> DroverResult<Option<AgentMessage>> {
        Ok(None)
    }

    /// Release resources owned by the executor. Called once per agent stop.
    async fn cleanup(&self) -> DroverResult<()> {
        Ok(())
    }
}
