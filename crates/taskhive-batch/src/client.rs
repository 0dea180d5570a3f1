use async_trait::async_trait;
use futures_util::future::try_join_all;
use taskhive_core::{HiveError, HiveResult};
use taskhive_orchestrator::CommandBackendConfig;
use tracing::debug;

/// Transport to an external model endpoint.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Answer every prompt for one model. The response at index `i` belongs
    /// to prompt `i`.
    async fn complete_batch(&self, model: &str, prompts: &[String]) -> HiveResult<Vec<String>>;
}

/// Answers prompts by running a command-line model client once per prompt,
/// all prompts of a batch concurrently.
///
/// The command line is `<program> <args…> <prompt> [<model_flag> <model>]`.
pub struct CommandModelClient {
    config: CommandBackendConfig,
}

impl CommandModelClient {
    pub fn new(config: CommandBackendConfig) -> Self {
        Self { config }
    }

    async fn complete_one(&self, model: &str, prompt: &str) -> HiveResult<String> {
        let mut cmd = tokio::process::Command::new(&self.config.program);
        cmd.args(&self.config.args).arg(prompt);
        if let Some(flag) = &self.config.model_flag {
            cmd.arg(flag).arg(model);
        }
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        let output = cmd.kill_on_drop(true).output().await.map_err(|e| {
            HiveError::Execution(format!("failed to run '{}': {e}", self.config.program))
        })?;
        if !output.status.success() {
            return Err(HiveError::Execution(format!(
                "'{}' exited with {}: {}",
                self.config.program,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ModelClient for CommandModelClient {
    fn name(&self) -> &str {
        "command"
    }

    async fn complete_batch(&self, model: &str, prompts: &[String]) -> HiveResult<Vec<String>> {
        debug!(model, prompts = prompts.len(), program = %self.config.program, "Running model batch");
        try_join_all(prompts.iter().map(|p| self.complete_one(model, p))).await
    }
}
