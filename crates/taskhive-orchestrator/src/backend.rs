use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use taskhive_core::{HiveError, HiveResult, TaskId};
use tracing::info;

/// What the coordinator hands to a backend for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub agent: String,
    pub description: String,
    pub model: Option<String>,
    /// Zero-based attempt number; `retry_count` of the task at dispatch.
    pub attempt: u32,
}

/// Result of one backend attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn success(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: true,
            output: output.into(),
            duration,
        }
    }

    pub fn failure(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            output: output.into(),
            duration,
        }
    }
}

/// Performs the work behind a task.
///
/// Backends are opaque to the coordinator: an `Ok` outcome with
/// `success == false` and a retryable `Err` are both treated as execution
/// failures and retried under the task's budget.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn execute(&self, request: &ExecutionRequest) -> HiveResult<ExecutionOutcome>;
}

/// Settings for [`CommandBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandBackendConfig {
    /// Program to run for each task.
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before the task description.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Flag used to pass the task's model, e.g. `--model`. `None` skips it.
    #[serde(default = "default_model_flag")]
    pub model_flag: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_program() -> String {
    "claude".to_string()
}
fn default_args() -> Vec<String> {
    vec!["-p".to_string()]
}
fn default_model_flag() -> Option<String> {
    Some("--model".to_string())
}

impl Default for CommandBackendConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            model_flag: default_model_flag(),
            working_dir: None,
        }
    }
}

/// Runs an external program per task.
///
/// The command line is `<program> <args…> <description> [<model_flag> <model>]`.
/// The task id and agent name are exported as `TASKHIVE_TASK_ID` and
/// `TASKHIVE_AGENT`. A non-zero exit is a failed outcome carrying stderr.
pub struct CommandBackend {
    config: CommandBackendConfig,
}

impl CommandBackend {
    pub fn new(config: CommandBackendConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &ExecutionRequest) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.config.program);
        cmd.args(&self.config.args).arg(&request.description);
        if let (Some(flag), Some(model)) = (&self.config.model_flag, &request.model) {
            cmd.arg(flag).arg(model);
        }
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.env("TASKHIVE_TASK_ID", request.task_id.to_string())
            .env("TASKHIVE_AGENT", &request.agent)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ExecutionBackend for CommandBackend {
    fn name(&self) -> &str {
        "command"
    }

    async fn execute(&self, request: &ExecutionRequest) -> HiveResult<ExecutionOutcome> {
        info!(
            task_id = %request.task_id,
            agent = %request.agent,
            program = %self.config.program,
            attempt = request.attempt,
            "Spawning task command"
        );

        let started = Instant::now();
        let output = self.command(request).output().await.map_err(|e| {
            HiveError::Execution(format!(
                "failed to run '{}': {e}",
                self.config.program
            ))
        })?;
        let duration = started.elapsed();

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            Ok(ExecutionOutcome::success(stdout, duration))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Ok(ExecutionOutcome::failure(
                format!(
                    "exit {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
                duration,
            ))
        }
    }
}
