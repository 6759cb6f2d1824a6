//! Client error types.

use thiserror::Error;
use warren_wire::{ErrorBody, ErrorKind, WireError};

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors from client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level failure.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The server returned a structured error.
    #[error("remote error: {0}")]
    Remote(ErrorBody),

    /// The call did not complete within its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Connecting to the server failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// TLS material could not be loaded.
    #[error("tls configuration error: {0}")]
    Tls(String),

    /// The server answered with a shape the call did not expect.
    #[error("unexpected response variant")]
    UnexpectedResponse,
}

impl ClientError {
    /// The remote error kind, if this is a remote error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Remote(body) => Some(body.kind),
            _ => None,
        }
    }

    pub fn is_not_leader(&self) -> bool {
        self.kind() == Some(ErrorKind::NotLeader)
    }

    /// The hinted leader address, if this is a `NotLeader` error.
    pub fn leader_hint(&self) -> Option<&str> {
        match self {
            Self::Remote(body) => body.leader_hint.as_deref(),
            _ => None,
        }
    }
}
