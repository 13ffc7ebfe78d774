use thiserror::Error;

/// Errors raised while configuring or running a latency sweep.
///
/// Cancellation is not an error: it is reported through [`crate::sweep::RunStatus`].
/// A failed core binding is not an error either, see [`crate::affinity::AffinityOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SweepError {
    /// Empty, duplicate or non-positive configuration
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The chase buffer for a size could not be allocated
    #[error("could not allocate chase buffer for {size_kb} KiB")]
    AllocationFailure { size_kb: u64 },

    /// The monotonic clock returned an unusable reading
    #[error("timer read failed while measuring {size_kb} KiB")]
    TimerFailure { size_kb: u64 },

    /// A run was started while another one is still active on the same sweep
    #[error("a sweep is already running on this instance")]
    StateConflict,

    /// A notification callback or the probe panicked on the worker
    #[error("sweep worker panicked: {0}")]
    Panicked(String),

    /// The worker thread could not be spawned
    #[error("failed to spawn sweep worker: {0}")]
    Spawn(String),
}

impl SweepError {
    /// Failures local to a single measurement that are worth one retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SweepError::TimerFailure { .. })
    }
}

pub type Result<T> = std::result::Result<T, SweepError>;
