use thiserror::Error;

/// Convenience alias for Results using [`OrchestratorError`].
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Error taxonomy for the studio orchestrator.
///
/// Variants map directly onto the kinds a caller needs to branch on: a
/// `NotFound` never halts a polling loop, a `Validation` never mutates
/// state, and so on. See each variant's doc comment for its propagation
/// policy.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Workspace/task/step/workflow by id is absent. Surfaced to the
    /// caller; never causes a polling loop to exit.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invariant violation attempting to add/update a task or scheduled
    /// task. Surfaced to the caller unchanged; the workspace is not
    /// modified.
    #[error("validation error: {0}")]
    Validation(String),

    /// Durable write/read failed. Polling loops log and skip the
    /// affected workspace for that tick.
    #[error("storage error: {0}")]
    Storage(String),

    /// A task or step body returned an error, including timeout and
    /// cancellation. Recorded on the task/step; does not propagate to
    /// the polling loop.
    #[error("execution error: {0}")]
    Execution(String),

    /// Failure to materialize a scheduled task. Counted toward
    /// `failure_count`.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// `Stop()` failed to drain running work within a reasonable bound.
    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(what: impl Into<String>) -> Self {
        Self::Validation(what.into())
    }

    pub fn storage(what: impl Into<String>) -> Self {
        Self::Storage(what.into())
    }

    pub fn execution(what: impl Into<String>) -> Self {
        Self::Execution(what.into())
    }

    pub fn scheduler(what: impl Into<String>) -> Self {
        Self::Scheduler(what.into())
    }
}
