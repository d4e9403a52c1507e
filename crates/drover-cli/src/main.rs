//! `drover` - run workflows against a configured pool of agents.

mod executors;

use anyhow::Context;
use clap::{Parser, Subcommand};
use drover_core::DroverResult;
use drover_orchestrator::{
    Agent, DroverConfig, Orchestrator, TaskSpec, Workflow, WorkflowDefinition, WorkflowStatus,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "drover", about = "Drover - agent task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "drover.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file (TOML or JSON) and print the final record
    Run {
        /// Workflow definition to execute
        workflow: PathBuf,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Submit one task and print it once it finishes
    Submit {
        /// Agent type to dispatch to
        agent_type: String,
        /// Task type understood by that agent
        task_type: String,
        /// Task input as JSON
        #[arg(long)]
        input: Option<String>,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Validate the config and list the agents it declares
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let config = DroverConfig::load(&cli.config).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to load config file '{}': {}",
            cli.config.display(),
            e
        )
    })?;

    match cli.command {
        Commands::Check => check(&config)?,
        Commands::Run {
            workflow,
            timeout_secs,
        } => {
            let definition = WorkflowDefinition::load(&workflow)
                .await
                .with_context(|| format!("Failed to load workflow '{}'", workflow.display()))?;
            definition.validate()?;

            let orchestrator = build_orchestrator(&config).await?;
            let outcome = run_workflow(&orchestrator, definition, timeout_secs).await;
            orchestrator.stop().await?;

            let record = outcome?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            if record.status == WorkflowStatus::Failed {
                anyhow::bail!(
                    "workflow '{}' failed: {}",
                    record.name,
                    record.error.unwrap_or_default()
                );
            }
        }
        Commands::Submit {
            agent_type,
            task_type,
            input,
            timeout_secs,
        } => {
            let input = match input {
                Some(raw) => serde_json::from_str(&raw).context("--input is not valid JSON")?,
                None => serde_json::Value::Null,
            };
            let orchestrator = build_orchestrator(&config).await?;
            let outcome = submit_and_wait(
                &orchestrator,
                &agent_type,
                TaskSpec::new(task_type).with_input(input),
                timeout_secs,
            )
            .await;
            orchestrator.stop().await?;
            println!("{}", serde_json::to_string_pretty(&outcome?)?);
        }
    }

    Ok(())
}

fn check(config: &DroverConfig) -> anyhow::Result<()> {
    for entry in &config.agents {
        executors::build_executor(&entry.executor)?;
    }
    if config.agents.is_empty() {
        println!("No agents configured.");
        println!("Declare agents in drover.toml under [[agents]]");
        return Ok(());
    }
    println!("Configured agents:");
    for entry in &config.agents {
        let capabilities: Vec<&str> = entry
            .agent
            .capabilities
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        println!(
            "  {} (type: {}, executor: {}, instances: {})",
            entry.agent.name, entry.agent_type, entry.executor, entry.instances
        );
        println!("    capabilities: {}", capabilities.join(", "));
    }
    let total: usize = config.agents.iter().map(|e| e.instances).sum();
    println!("\nTotal: {total} agent(s), max {}", config.orchestrator.max_agents);
    Ok(())
}

/// Create the orchestrator, register every configured agent instance and
/// start the health loop.
async fn build_orchestrator(config: &DroverConfig) -> DroverResult<Orchestrator> {
    let orchestrator = Orchestrator::new(config.orchestrator.clone())?;
    for entry in &config.agents {
        let executor = executors::build_executor(&entry.executor)?;
        for _ in 0..entry.instances {
            let agent = Agent::new(entry.agent.clone(), executor.clone())?;
            orchestrator
                .register_agent(agent, entry.agent_type.as_str())
                .await?;
        }
    }
    orchestrator.start();
    info!(
        agents = orchestrator.agent_count().await,
        "Orchestrator ready"
    );
    Ok(orchestrator)
}

async fn run_workflow(
    orchestrator: &Orchestrator,
    definition: WorkflowDefinition,
    timeout_secs: u64,
) -> anyhow::Result<Workflow> {
    let workflow_id = orchestrator.execute_workflow(definition).await?;
    let poll_interval = orchestrator.config().poll_interval();
    let wait = async {
        loop {
            match orchestrator.get_workflow_status(workflow_id).await {
                Some(workflow) if workflow.is_terminal() => return Ok(workflow),
                Some(_) => tokio::time::sleep(poll_interval).await,
                None => anyhow::bail!("workflow {workflow_id} disappeared"),
            }
        }
    };
    tokio::select! {
        outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), wait) => {
            outcome.map_err(|_| anyhow::anyhow!("workflow {workflow_id} still running after {timeout_secs}s"))?
        }
        _ = tokio::signal::ctrl_c() => {
            warn!(workflow_id = %workflow_id, "Interrupted, shutting down");
            anyhow::bail!("interrupted")
        }
    }
}

async fn submit_and_wait(
    orchestrator: &Orchestrator,
    agent_type: &str,
    spec: TaskSpec,
    timeout_secs: u64,
) -> anyhow::Result<drover_orchestrator::Task> {
    let assignment = orchestrator.submit_task(agent_type, spec).await?;
    info!(
        agent_id = %assignment.agent_id,
        task_id = %assignment.task_id,
        "Task submitted"
    );
    let poll_interval = orchestrator.config().poll_interval();
    let wait = async {
        loop {
            let task = orchestrator
                .get_task(&assignment.agent_id, assignment.task_id)
                .await?;
            if task.is_terminal() {
                return Ok::<_, anyhow::Error>(task);
            }
            tokio::time::sleep(poll_interval).await;
        }
    };
    tokio::select! {
        outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), wait) => {
            outcome.map_err(|_| anyhow::anyhow!("task {} still running after {timeout_secs}s", assignment.task_id))?
        }
        _ = tokio::signal::ctrl_c() => {
            warn!(task_id = %assignment.task_id, "Interrupted, shutting down");
            anyhow::bail!("interrupted")
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = include_str!("../../../drover.toml");
    const SAMPLE_WORKFLOW: &str = include_str!("../../../workflows/ingest.toml");

    #[test]
    fn test_sample_files_are_valid() {
        let config = DroverConfig::from_toml_str(SAMPLE_CONFIG).unwrap();
        assert!(check(&config).is_ok());
        let workflow = WorkflowDefinition::from_toml_str(SAMPLE_WORKFLOW).unwrap();
        assert!(workflow.validate().is_ok());
    }

    #[tokio::test]
    async fn test_sample_workflow_completes() {
        let mut config = DroverConfig::from_toml_str(SAMPLE_CONFIG).unwrap();
        config.orchestrator.poll_interval_ms = 5;
        for entry in &mut config.agents {
            entry.agent.tick_interval_ms = 5;
        }
        let orchestrator = build_orchestrator(&config).await.unwrap();
        assert_eq!(orchestrator.agent_count().await, 3);

        let definition = WorkflowDefinition::from_toml_str(SAMPLE_WORKFLOW).unwrap();
        let record = run_workflow(&orchestrator, definition, 10).await.unwrap();
        orchestrator.stop().await.unwrap();

        assert_eq!(record.status, WorkflowStatus::Completed);
        assert_eq!(record.results.len(), 4);
        assert_eq!(record.results[0].step_id.as_deref(), Some("fetch"));
    }

    #[tokio::test]
    async fn test_submit_and_wait_returns_finished_task() {
        let config = DroverConfig::from_toml_str(SAMPLE_CONFIG).unwrap();
        let orchestrator = build_orchestrator(&config).await.unwrap();
        let task = submit_and_wait(
            &orchestrator,
            "ingest",
            TaskSpec::new("fetch").with_input(serde_json::json!({"n": 1})),
            10,
        )
        .await
        .unwrap();
        orchestrator.stop().await.unwrap();
        assert_eq!(task.status, drover_orchestrator::TaskStatus::Completed);
        assert_eq!(task.result.unwrap()["input"]["n"], 1);
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["drover", "-c", "x.toml", "run", "flow.json"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        match cli.command {
            Commands::Run {
                workflow,
                timeout_secs,
            } => {
                assert_eq!(workflow, PathBuf::from("flow.json"));
                assert_eq!(timeout_secs, 300);
            }
            _ => panic!("expected run"),
        }
    }
}
