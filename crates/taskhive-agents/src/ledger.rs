use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taskhive_core::HiveResult;

/// An agent entry as recorded in the persistent ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAgent {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub expertise: Vec<String>,
    #[serde(default)]
    pub max_load: Option<u32>,
}

impl LedgerAgent {
    pub fn new(name: impl Into<String>, role: impl Into<String>, expertise: Vec<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            expertise,
            max_load: None,
        }
    }
}

/// The external source of truth for which agents exist.
///
/// The directory syncs from the ledger at startup or on demand, never per
/// task.
#[async_trait]
pub trait AgentLedger: Send + Sync {
    /// Every agent currently on the ledger.
    async fn list_agents(&self) -> HiveResult<Vec<LedgerAgent>>;

    /// Whether an agent with this name is on the ledger.
    async fn exists(&self, name: &str) -> HiveResult<bool> {
        Ok(self.list_agents().await?.iter().any(|a| a.name == name))
    }
}

/// Ledger backed by a fixed list, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticLedger {
    agents: Vec<LedgerAgent>,
}

impl StaticLedger {
    pub fn new(agents: Vec<LedgerAgent>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl AgentLedger for StaticLedger {
    async fn list_agents(&self) -> HiveResult<Vec<LedgerAgent>> {
        Ok(self.agents.clone())
    }
}
