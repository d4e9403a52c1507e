//! Executors the `drover` binary can back agents with, selected by the
//! `executor` key of an `[[agents]]` entry.

use async_trait::async_trait;
use drover_core::{DroverError, DroverResult};
use drover_orchestrator::{Task, TaskExecutor};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Names accepted in the `executor` field.
pub const BUILTIN_EXECUTORS: [&str; 2] = ["echo", "delay"];

/// Returns the task's type, input and context unchanged.
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(
        &self,
        task: &Task,
        _cancel: CancellationToken,
    ) -> DroverResult<serde_json::Value> {
        Ok(serde_json::json!({
            "task_type": task.task_type,
            "input": task.input,
            "context": task.context,
        }))
    }
}

/// Sleeps for `input.delay_ms` (default 100), then echoes the input.
/// Stops early if the task is cancelled. `input.fail = true` makes the
/// attempt fail after the delay.
pub struct DelayExecutor;

const DEFAULT_DELAY_MS: u64 = 100;

#[async_trait]
impl TaskExecutor for DelayExecutor {
    async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> DroverResult<serde_json::Value> {
        let delay_ms = task
            .input
            .get("delay_ms")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(DEFAULT_DELAY_MS);
        debug!(task_id = %task.id, delay_ms, "Delaying task");

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DroverError::TaskExecution(format!("task {} cancelled", task.id)));
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
        }

        if task.input.get("fail").and_then(serde_json::Value::as_bool) == Some(true) {
            return Err(DroverError::TaskExecution(format!(
                "task {} failed on request",
                task.id
            )));
        }
        Ok(serde_json::json!({ "delayed_ms": delay_ms, "input": task.input }))
    }
}

/// Look up a built-in executor by name.
pub fn build_executor(name: &str) -> DroverResult<Arc<dyn TaskExecutor>> {
    match name {
        "echo" => Ok(Arc::new(EchoExecutor)),
        "delay" => Ok(Arc::new(DelayExecutor)),
        other => Err(DroverError::Config(format!(
            "unknown executor '{other}', expected one of: {}",
            BUILTIN_EXECUTORS.join(", ")
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use drover_orchestrator::TaskSpec;

    fn task(input: serde_json::Value) -> Task {
        Task::from_spec(TaskSpec::new("work").with_input(input), 0)
    }

    #[tokio::test]
    async fn test_echo_returns_input() {
        let out = EchoExecutor
            .execute(&task(serde_json::json!({"a": 1})), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["task_type"], "work");
        assert_eq!(out["input"]["a"], 1);
    }

    #[tokio::test]
    async fn test_delay_waits_then_echoes() {
        let started = tokio::time::Instant::now();
        let out = DelayExecutor
            .execute(&task(serde_json::json!({"delay_ms": 20})), CancellationToken::new())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(out["delayed_ms"], 20);
    }

    #[tokio::test]
    async fn test_delay_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = DelayExecutor
            .execute(&task(serde_json::json!({"delay_ms": 60_000})), cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_delay_can_fail_on_request() {
        let err = DelayExecutor
            .execute(
                &task(serde_json::json!({"delay_ms": 1, "fail": true})),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DroverError::TaskExecution(_)));
    }

    #[test]
    fn test_unknown_executor() {
        assert!(build_executor("echo").is_ok());
        assert!(build_executor("delay").is_ok());
        let err = build_executor("gpt").err().unwrap();
        assert!(err.to_string().contains("echo, delay"));
    }
}
