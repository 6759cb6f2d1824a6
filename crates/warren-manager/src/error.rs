//! Manager error types and their wire mapping.

use std::sync::PoisonError;

use thiserror::Error;
use warren_fsm::FsmError;
use warren_log::LogError;
use warren_store::StoreError;
use warren_wire::{ErrorBody, ErrorKind};

/// Result type for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors raised while serving RPCs.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Syntactic validation failed before submission.
    #[error("validation: {0}")]
    Validation(String),

    /// An entity was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Writes arrived on the read-only IPC endpoint.
    #[error("writes are not permitted on this endpoint")]
    PermissionDenied,

    /// Replication-layer failure.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Store read failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Secret sealing failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] warren_crypto::CryptoError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bug on our side; logged and surfaced as Internal.
    #[error("internal: {0}")]
    Internal(String),
}

impl<T> From<PoisonError<T>> for ManagerError {
    fn from(_: PoisonError<T>) -> Self {
        ManagerError::Internal("state lock poisoned".to_string())
    }
}

impl ManagerError {
    /// Maps to the wire taxonomy.
    pub fn to_wire(&self) -> ErrorBody {
        match self {
            ManagerError::Validation(message) => ErrorBody::new(ErrorKind::Validation, message),
            ManagerError::NotFound(message) => ErrorBody::new(ErrorKind::NotFound, message),
            ManagerError::PermissionDenied => {
                ErrorBody::new(ErrorKind::PermissionDenied, self.to_string())
            }
            ManagerError::Log(LogError::NotLeader { hint }) => ErrorBody::not_leader(hint.clone()),
            ManagerError::Log(LogError::QuorumLost) => {
                ErrorBody::new(ErrorKind::QuorumLost, "quorum lost; cluster is read-only")
            }
            ManagerError::Log(LogError::ApplyTimeout) => {
                ErrorBody::new(ErrorKind::DeadlineExceeded, "apply timed out")
            }
            ManagerError::Log(LogError::InvalidCommand(fsm)) => fsm_to_wire(fsm),
            ManagerError::Store(StoreError::NotFound { collection, key }) => ErrorBody::new(
                ErrorKind::NotFound,
                format!("{collection}/{key} not found"),
            ),
            ManagerError::Log(_)
            | ManagerError::Store(_)
            | ManagerError::Crypto(_)
            | ManagerError::Io(_)
            | ManagerError::Internal(_) => ErrorBody::new(ErrorKind::Internal, self.to_string()),
        }
    }
}

/// Apply-time validation errors keep their store semantics on the wire.
fn fsm_to_wire(error: &FsmError) -> ErrorBody {
    let kind = match error {
        FsmError::ServiceNameExists(_)
        | FsmError::SecretNameExists(_)
        | FsmError::VolumeNameExists(_)
        | FsmError::NodeExists(_)
        | FsmError::MemberExists(_)
        | FsmError::SlotOccupied { .. } => ErrorKind::AlreadyExists,
        FsmError::ServiceNotFound(_)
        | FsmError::ContainerNotFound(_)
        | FsmError::NodeNotFound(_)
        | FsmError::SecretNotFound(_)
        | FsmError::MissingSecret(_)
        | FsmError::VolumeNotFound(_)
        | FsmError::MissingVolume(_)
        | FsmError::MemberUnknown(_) => ErrorKind::NotFound,
        FsmError::Store(_) => ErrorKind::Internal,
        _ => ErrorKind::Validation,
    };
    ErrorBody::new(kind, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_keeps_its_hint() {
        let error = ManagerError::Log(LogError::NotLeader {
            hint: Some("10.0.0.2:7421".to_string()),
        });
        let wire = error.to_wire();
        assert_eq!(wire.kind, ErrorKind::NotLeader);
        assert_eq!(wire.leader_hint.as_deref(), Some("10.0.0.2:7421"));
    }

    #[test]
    fn duplicate_name_maps_to_already_exists() {
        let error = ManagerError::Log(LogError::InvalidCommand(FsmError::ServiceNameExists(
            "web".to_string(),
        )));
        assert_eq!(error.to_wire().kind, ErrorKind::AlreadyExists);
    }
}
