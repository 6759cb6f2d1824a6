//! # warren-wire: the RPC wire protocol
//!
//! One versioned namespace of request/response shapes shared by managers,
//! workers, and the CLI, plus the framing that carries them: a magic +
//! length header followed by a postcard-encoded envelope. Changes to these
//! shapes are additive only.
//!
//! ```text
//! ┌─────────┬─────────┬──────────────────────┐
//! │ magic   │ length  │ postcard payload     │
//! │ 4 bytes │ 4 bytes │ `length` bytes       │
//! └─────────┴─────────┴──────────────────────┘
//! ```
//!
//! Connections are sequential request/response: one envelope in, one
//! envelope out. Every write carries a client-generated request id so a
//! retried command applies at most once.

mod frame;
mod protocol;

pub use frame::{MAX_FRAME_LEN, WIRE_MAGIC, read_frame, write_frame};
pub use protocol::{
    ClusterInfo, ContainerFilter, ErrorBody, ErrorKind, Request, RequestEnvelope, Response,
    SecretInfo, StateReport,
};

use thiserror::Error;

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors from framing and decoding.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad frame magic: {0:#010x}")]
    BadMagic(u32),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u32),

    #[error("payload decode error: {0}")]
    Decode(String),

    #[error("connection closed")]
    ConnectionClosed,
}
