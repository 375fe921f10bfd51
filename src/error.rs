//! Error taxonomy for the dispatch kernel.
//!
//! Every public operation returns [`KernelResult`]. Variants map onto the
//! category tags callers are expected to match on (queue-full, validation,
//! not-found, timeout, dependency, resource, cycle, task failure) rather than
//! on the formatted message, which is free to change.

use thiserror::Error;

/// Result alias used throughout the kernel's public API.
pub type KernelResult<T> = Result<T, KernelError>;

/// Category-tagged error surfaced by any kernel component.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Submission rejected because the queue is at `max_queue_size`.
    #[error("queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured capacity that was reached.
        capacity: usize,
    },

    /// Submission rejected because the task id is already tracked.
    #[error("task id `{0}` is already registered")]
    DuplicateId(String),

    /// Lookup found no task, scheduled entry, or breaker with the given id.
    #[error("`{0}` not found")]
    NotFound(String),

    /// Caller-supplied argument violates a documented invariant.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A dependency graph registered for execution contains a cycle.
    #[error("dependency cycle detected involving `{0}`")]
    CycleDetected(String),

    /// A deadline was exceeded at task, batch, or external-call level.
    #[error("`{0}` timed out")]
    Timeout(String),

    /// A circuit breaker is open, or a named collaborator is unavailable.
    #[error("circuit `{0}` is open")]
    CircuitOpen(String),

    /// Resource capacity could not be satisfied atomically.
    #[error("resource `{class}` unavailable (requested {amount})")]
    ResourceUnavailable {
        /// Resource class that could not be allocated.
        class: String,
        /// Fractional amount requested.
        amount: f64,
    },

    /// The task callable itself raised.
    #[error("task `{task_id}` failed: {message}")]
    TaskFailed {
        /// Id of the task whose callable raised.
        task_id: String,
        /// Message captured from the callable's error.
        message: String,
        /// Underlying cause, when the callable's error carries one.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// OS/process-level problem (I/O, filesystem, clock).
    #[error("system error: {0}")]
    System(#[from] std::io::Error),

    /// Serialization failure in the snapshot path.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Fallback for conditions that don't fit another category.
    #[error("unknown kernel error: {0}")]
    Unknown(String),
}

impl KernelError {
    /// Short category tag matching the external error surface of the design.
    pub fn category(&self) -> &'static str {
        match self {
            KernelError::QueueFull { .. } => "RESOURCE",
            KernelError::DuplicateId(_) => "VALIDATION",
            KernelError::NotFound(_) => "NOT_FOUND",
            KernelError::Validation(_) => "VALIDATION",
            KernelError::CycleDetected(_) => "DEPENDENCY",
            KernelError::Timeout(_) => "TIMEOUT",
            KernelError::CircuitOpen(_) => "DEPENDENCY",
            KernelError::ResourceUnavailable { .. } => "RESOURCE",
            KernelError::TaskFailed { .. } => "TASK_FAILED",
            KernelError::System(_) => "SYSTEM",
            KernelError::Serialization(_) => "SYSTEM",
            KernelError::Unknown(_) => "UNKNOWN",
        }
    }
}
