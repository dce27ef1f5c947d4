//! Error types for the log-system engine.

use thiserror::Error;

/// Result type for engine operations.
pub type LogResult<T> = Result<T, EngineError>;

/// Errors surfaced by the log-system coordinator.
///
/// `MasterTLogFailed` and `MasterRecoveryFailed` are fatal: the caller is
/// expected to tear the log system down and restart recovery. Transport
/// errors pass through so quorum logic can absorb them; `Cancelled` is
/// always silent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The current epoch's write quorum is lost.
    #[error("master tlog failed")]
    MasterTLogFailed,

    /// New-epoch initialization aborted.
    #[error("master recovery failed")]
    MasterRecoveryFailed,

    /// Impossible configuration or violated internal invariant.
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// The operation's task was torn down.
    #[error("operation cancelled")]
    Cancelled,

    /// A transport-level failure talking to one server.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl EngineError {
    /// True for errors that must not be reported through background error
    /// channels: cancellation and stop-signaling are silent.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            EngineError::Cancelled | EngineError::Transport(TransportError::Stopped)
        )
    }
}

/// Transport-level errors returned by TLog and worker clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The remote endpoint vanished mid-request.
    #[error("broken promise")]
    BrokenPromise,

    /// The TLog has stopped accepting this class of request.
    #[error("tlog stopped")]
    Stopped,

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// Any other connection-level failure.
    #[error("connection error: {0}")]
    Connection(String),
}
