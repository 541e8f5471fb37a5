//! Error types for evaluation, rule sources and the scheduler loop.

use cadence_core::CoreError;

use crate::cancel::StopReason;

/// Outcome of a failed evaluation attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// Evaluator or network failure. Retried with backoff.
    #[error("transient evaluation failure: {0}")]
    Transient(String),

    /// The rule itself is broken (e.g. the condition refers to a missing
    /// query). Never retried.
    #[error("invalid rule definition: {0}")]
    Definition(String),

    /// The evaluation was abandoned because its token was cancelled.
    #[error("evaluation cancelled: {0}")]
    Cancelled(StopReason),
}

impl EvalError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EvalError::Transient(_))
    }

    /// Cancelled because the rule or its group is going away. A deadline
    /// timeout is not a stop and is reported like any other failure.
    pub fn is_stop(&self) -> bool {
        matches!(self, EvalError::Cancelled(reason) if *reason != StopReason::Timeout)
    }
}

/// Errors raised by a rule source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("rule store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors raised by sinks (notifier, recording writer).
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("write failed: {0}")]
    Write(String),
}

/// Errors returned from a scheduling cycle.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to fetch rules: {0}")]
    Fetch(#[from] SourceError),

    #[error("rule {rule} references folder {folder} which was not returned by the rule source")]
    MissingFolder { rule: String, folder: String },

    #[error("configuration error: {0}")]
    Config(#[from] CoreError),
}

/// Result alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
