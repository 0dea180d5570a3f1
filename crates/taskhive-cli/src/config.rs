use serde::{Deserialize, Serialize};
use std::path::Path;
use taskhive_agents::{DirectoryConfig, LedgerAgent};
use taskhive_batch::BatchConfig;
use taskhive_channels::{Route, RouterConfig};
use taskhive_core::{HiveError, HiveResult};
use taskhive_orchestrator::{CommandBackendConfig, ResourceConfig, SchedulerConfig};
use tracing::info;

/// How tasks are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// One process per task.
    #[default]
    Command,
    /// Task descriptions sent as prompts through the batch processor.
    Batched,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default)]
    pub command: CommandBackendConfig,
}

/// Where task lifecycle notifications go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Recipient name used for forwarded task events.
    #[serde(default = "default_recipient")]
    pub recipient: String,
    /// Forward Submitted/Ready/Started events as well.
    #[serde(default)]
    pub verbose: bool,
}

fn default_recipient() -> String {
    "operators".to_string()
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            recipient: default_recipient(),
            verbose: false,
        }
    }
}

/// Top-level `taskhive.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HiveConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Agent ledger entries.
    #[serde(default)]
    pub agents: Vec<LedgerAgent>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl HiveConfig {
    /// Read a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> HiveResult<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)?;
        info!(
            path = %path.display(),
            agents = config.agents.len(),
            routes = config.routes.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> HiveResult<Self> {
        toml::from_str(raw).map_err(|e| HiveError::Config(format!("invalid config: {e}")))
    }

    pub fn validate(&self) -> HiveResult<()> {
        if self.resources.max_concurrent_agents == 0 {
            return Err(HiveError::Config(
                "resources.max_concurrent_agents must be at least 1".into(),
            ));
        }
        if self.directory.default_max_load == 0 {
            return Err(HiveError::Config(
                "directory.default_max_load must be at least 1".into(),
            ));
        }
        if self.scheduler.event_capacity == 0 {
            return Err(HiveError::Config(
                "scheduler.event_capacity must be at least 1".into(),
            ));
        }
        self.router.validate()?;
        self.batch.validate()?;

        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(HiveError::Config("agent with an empty name".into()));
            }
            if agent.max_load == Some(0) {
                return Err(HiveError::Config(format!(
                    "agent '{}' has max_load 0",
                    agent.name
                )));
            }
        }
        for route in &self.routes {
            if route.targets.is_empty() {
                return Err(HiveError::Config(format!(
                    "route for '{}' has no targets",
                    route.recipient
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[scheduler]
max_retries = 5
cycle_policy = "reject"

[resources]
max_concurrent_agents = 2

[router]
workers = 2
batch_size = 5

[backend]
kind = "batched"

[backend.command]
program = "echo"
args = []

[notify]
recipient = "oncall"

[[agents]]
name = "alice"
role = "backend"
expertise = ["rust", "sql"]
max_load = 2

[[agents]]
name = "bob"
role = "frontend"

[[routes]]
recipient = "oncall"
batched = true
targets = [{ handler = "log", weight = 2.0 }]
"#;

    #[test]
    fn test_parse_full_config() {
        let config = HiveConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.scheduler.max_retries, 5);
        assert_eq!(config.resources.max_concurrent_agents, 2);
        assert_eq!(config.router.workers, 2);
        assert_eq!(config.router.queue_capacity, 1000);
        assert_eq!(config.backend.kind, BackendKind::Batched);
        assert_eq!(config.backend.command.program, "echo");
        assert_eq!(config.notify.recipient, "oncall");
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].max_load, Some(2));
        assert!(config.routes[0].batched);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HiveConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.backend.kind, BackendKind::Command);
        assert!(config.agents.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = HiveConfig::load(file.path()).unwrap();
        assert_eq!(config.agents[1].name, "bob");
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = HiveConfig::from_toml("[resources\nmax = ").unwrap_err();
        assert!(matches!(err, HiveError::Config(_)));
    }

    #[test]
    fn test_validation_rejects_zero_capacities() {
        let mut config = HiveConfig::default();
        config.resources.max_concurrent_agents = 0;
        assert!(config.validate().is_err());

        let mut config = HiveConfig::default();
        config.router.workers = 0;
        assert!(config.validate().is_err());

        let mut config = HiveConfig::default();
        config.agents.push(LedgerAgent {
            max_load: Some(0),
            ..LedgerAgent::new("carol", "ops", vec![])
        });
        assert!(config.validate().is_err());
    }
}
