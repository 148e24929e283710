//! Engine-level errors.
//!
//! Per-transaction failures are never errors: they are reported as a
//! [`ResultCode`](crate::result::ResultCode) inside a transaction result. An
//! `EngineError` means the engine itself can no longer be trusted.

use thiserror::Error;

/// Error type for engine lifecycle calls and fatal background faults.
///
/// The type is `Clone` so that a fault recorded by one executor thread can be
/// re-raised to every caller that touches the engine afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The configured number of executor threads was zero.
    #[error("thread count must be a positive integer")]
    InvalidThreadCount,

    /// An unrecoverable fault reported by a collaborator (kernel or runtime).
    #[error("fatal engine fault: {0}")]
    Fatal(String),

    /// An executor thread panicked while processing a transaction.
    #[error("executor thread panicked: {0}")]
    WorkerPanicked(String),

    /// An executor thread could not be spawned.
    #[error("failed to spawn executor thread: {0}")]
    Spawn(String),

    /// A batch was submitted while the previous one still had tasks in flight.
    #[error("previous batch still has transactions in flight")]
    BatchInProgress,

    /// The engine stopped before producing a result.
    #[error("engine has been shut down")]
    ShutDown,

    /// An internal bookkeeping invariant was broken.
    #[error("engine invariant violated: {0}")]
    Invariant(&'static str),
}

impl EngineError {
    pub fn fatal(message: impl Into<String>) -> Self {
        EngineError::Fatal(message.into())
    }
}
