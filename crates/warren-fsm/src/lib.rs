//! # warren-fsm: the deterministic core of Warren's control plane
//!
//! The FSM applies committed log commands to the store. It is the pure
//! functional heart of the system: no I/O, no clocks, no randomness. Every
//! replica applies the same sequence and arrives at byte-identical state.
//!
//! ```ignore
//! let mut fsm = Fsm::new();
//! let outcome = fsm.apply(&command)?;
//! // The log runtime persists snapshots via fsm.to_bytes()...
//! ```

mod apply;
mod command;
mod dedup;
#[cfg(test)]
mod tests;

pub use apply::{ApplyOutcome, Fsm, FsmError, MEMBERSHIP_KEY};
pub use command::{Command, ContainerStateUpdate, NodeStatusUpdate};
pub use dedup::{DEFAULT_DEDUP_CAPACITY, DedupRing};
