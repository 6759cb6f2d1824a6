//! Log error types.

use thiserror::Error;
use warren_fsm::FsmError;

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors surfaced to command submitters.
#[derive(Debug, Error)]
pub enum LogError {
    /// This replica cannot accept writes; retry against the hinted leader.
    #[error("not the leader (leader hint: {hint:?})")]
    NotLeader {
        /// Address of the current leader, when one is known.
        hint: Option<String>,
    },

    /// No quorum is reachable; the cluster is read-only.
    #[error("quorum lost")]
    QuorumLost,

    /// The command did not commit and apply within the deadline.
    #[error("apply timed out")]
    ApplyTimeout,

    /// Validation failed at apply; the store is untouched.
    #[error("invalid command: {0}")]
    InvalidCommand(#[from] FsmError),

    /// Durable log I/O failed. Fatal: the manager restarts and rejoins.
    #[error("log i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The log runtime has shut down.
    #[error("log runtime closed")]
    Closed,
}

impl LogError {
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Self::NotLeader { .. })
    }

    /// The leader hint, if this is a `NotLeader` error.
    pub fn leader_hint(&self) -> Option<&str> {
        match self {
            Self::NotLeader { hint } => hint.as_deref(),
            _ => None,
        }
    }
}
