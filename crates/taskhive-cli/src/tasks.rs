use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use taskhive_agents::TaskRequirements;
use taskhive_core::{HiveError, HiveResult, Priority, TaskId};
use taskhive_orchestrator::{Coordinator, TaskRequest};

/// One `[[tasks]]` entry of a task file. Dependencies refer to other
/// entries by name.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskEntry {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub expertise: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
}

impl TaskEntry {
    fn to_request(&self) -> TaskRequest {
        let mut request = TaskRequest::new(&self.description)
            .with_priority(self.priority)
            .with_resources(self.resources.clone())
            .with_requirements(TaskRequirements::new(
                self.task_type.clone(),
                self.expertise.clone(),
            ));
        if let Some(agent) = &self.agent {
            request = request.for_agent(agent);
        }
        if let Some(model) = &self.model {
            request = request.with_model(model);
        }
        if let Some(max_retries) = self.max_retries {
            request = request.with_max_retries(max_retries);
        }
        request.estimated_duration_ms = self.estimated_duration_ms;
        request
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

impl TaskFile {
    pub fn load(path: &Path) -> HiveResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> HiveResult<Self> {
        let file: Self =
            toml::from_str(raw).map_err(|e| HiveError::Config(format!("invalid task file: {e}")))?;
        file.validate()?;
        Ok(file)
    }

    /// Names must be unique and every dependency must name an entry.
    pub fn validate(&self) -> HiveResult<()> {
        let mut seen = HashMap::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if seen.insert(task.name.as_str(), i).is_some() {
                return Err(HiveError::Config(format!(
                    "duplicate task name '{}'",
                    task.name
                )));
            }
        }
        for task in &self.tasks {
            if let Some(missing) = task.depends_on.iter().find(|d| !seen.contains_key(d.as_str())) {
                return Err(HiveError::Config(format!(
                    "task '{}' depends on unknown task '{missing}'",
                    task.name
                )));
            }
        }
        Ok(())
    }

    /// Submit every entry, then wire the dependencies.
    ///
    /// Edges are added after all tasks exist so the file order does not
    /// matter; a cycle in the file is handled by the coordinator's cycle
    /// policy.
    pub fn submit_all(&self, coordinator: &Coordinator) -> HiveResult<HashMap<String, TaskId>> {
        let mut ids = HashMap::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let id = coordinator.submit_task(task.to_request())?;
            ids.insert(task.name.clone(), id);
        }
        for task in &self.tasks {
            for dep in &task.depends_on {
                let (Some(&from), Some(&to)) = (ids.get(&task.name), ids.get(dep)) else {
                    return Err(HiveError::Config(format!(
                        "task '{}' depends on unknown task '{dep}'",
                        task.name
                    )));
                };
                coordinator.add_dependency(from, to)?;
            }
        }
        Ok(ids)
    }
}
