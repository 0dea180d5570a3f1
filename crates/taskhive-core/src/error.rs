use thiserror::Error;

/// A convenience `Result` alias using [`HiveError`].
pub type HiveResult<T> = Result<T, HiveError>;

/// Top-level error type shared by every TaskHive component.
///
/// Variants follow the failure classes the dispatcher distinguishes:
/// capacity, execution, topology and routing, plus the ambient
/// configuration and I/O failures.
#[derive(Error, Debug)]
pub enum HiveError {
    /// A bounded gate (agent slot, resource lock, queue) had no room.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// A blocking acquire or an external call ran past its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The execution backend reported a failure.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The dependency graph is malformed (cycle, unknown task).
    #[error("Topology error: {0}")]
    Topology(String),

    /// No capable agent or handler could be selected.
    #[error("Routing error: {0}")]
    Routing(String),

    /// A task, agent, route or handler lookup failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// The operation was stopped by shutdown or cancellation.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HiveError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Execution failures, timeouts and capacity shortages are transient;
    /// topology, configuration and lookup failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HiveError::Execution(_)
                | HiveError::Timeout(_)
                | HiveError::Capacity(_)
                | HiveError::Io(_)
        )
    }
}
