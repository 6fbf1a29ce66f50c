use thiserror::Error;

/// Canonical scheduler error taxonomy used across crates.
///
/// Classification guidance:
/// - [`DqsError::Plan`]: the logical DAG is malformed or references an input
///   nobody produces; raised before anything is dispatched
/// - [`DqsError::Dispatch`]: a worker could not be reached or timed out
/// - [`DqsError::WorkerExecution`]: a worker ran a stage and reported failure
/// - [`DqsError::Resource`]: no live worker can satisfy a partition mapping
/// - [`DqsError::InvalidConfig`]: configuration/catalog contract violations
/// - [`DqsError::Canceled`]: the job was canceled by its owner
/// - [`DqsError::Io`]: raw filesystem IO failures from std APIs
#[derive(Debug, Error)]
pub enum DqsError {
    /// Unsatisfiable or malformed logical plan.
    ///
    /// Examples:
    /// - a node consumes a set that is neither a source nor produced by any node
    /// - duplicate node names or a dependency cycle
    #[error("plan error: {0}")]
    Plan(String),

    /// Communication failure or timeout reaching a worker.
    #[error("dispatch error on worker {worker}: {message}")]
    Dispatch {
        /// Address of the unreachable worker.
        worker: String,
        /// Transport-level failure description.
        message: String,
    },

    /// Operator-level failure reported by a worker for one stage.
    #[error("worker {worker} failed stage {stage_id}: {message}")]
    WorkerExecution {
        /// Address of the reporting worker.
        worker: String,
        /// Stage that failed on that worker.
        stage_id: u64,
        /// Worker-supplied error detail.
        message: String,
    },

    /// No live workers available to satisfy a partition mapping.
    #[error("resource error: {0}")]
    Resource(String),

    /// Invalid or inconsistent configuration/catalog state.
    ///
    /// Examples:
    /// - `partition_to_core_ratio <= 0`
    /// - unparsable catalog or cluster JSON
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Job canceled before reaching a terminal state on its own.
    #[error("canceled: {0}")]
    Canceled(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DqsError {
    /// Stable short label used in metrics and status reports.
    pub fn kind(&self) -> &'static str {
        match self {
            DqsError::Plan(_) => "plan",
            DqsError::Dispatch { .. } => "dispatch",
            DqsError::WorkerExecution { .. } => "worker_execution",
            DqsError::Resource(_) => "resource",
            DqsError::InvalidConfig(_) => "invalid_config",
            DqsError::Canceled(_) => "canceled",
            DqsError::Io(_) => "io",
        }
    }

    /// Worker implicated by this error, if any.
    pub fn worker(&self) -> Option<&str> {
        match self {
            DqsError::Dispatch { worker, .. } | DqsError::WorkerExecution { worker, .. } => {
                Some(worker)
            }
            _ => None,
        }
    }
}

/// Standard scheduler result alias.
pub type Result<T> = std::result::Result<T, DqsError>;
