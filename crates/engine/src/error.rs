use abacus_jobs::JobError;
use thiserror::Error;

/// Errors surfaced by the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A cycle or context was driven through an illegal state transition —
    /// a programming error reported immediately rather than tolerated.
    #[error("invalid state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error(transparent)]
    Job(#[from] JobError),

    /// Dispatch or execution of a whole batch job failed; fatal to the
    /// enclosing cycle (individual task failures are not — they surface as
    /// missing values).
    #[error("graph execution failed: {0}")]
    ExecutionFailed(String),

    #[error("execution interrupted")]
    Interrupted,

    #[error("previous cycle has not been executed")]
    PreviousCycleNotExecuted,

    #[error("unknown calculation configuration: {0}")]
    UnknownConfiguration(String),
}
