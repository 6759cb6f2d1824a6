//! # warren-manager: the manager daemon
//!
//! A manager hosts one replica of the replicated log, serves the RPC
//! surface, and (while it holds leadership) runs the scheduler and
//! reconciler loops that drive declared state into container
//! assignments.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        warren-manager                        │
//! │  ┌──────────┐   ┌────────────────┐   ┌────────────────────┐  │
//! │  │ Listener │ → │ RequestHandler │ → │ LogHandle (submit) │  │
//! │  │ (TCP/UDS)│   │ (read/forward) │   │  → FSM → Store     │  │
//! │  └──────────┘   └────────────────┘   └────────────────────┘  │
//! │        ┌───────────┐   ┌────────────┐        ▲               │
//! │        │ Scheduler │   │ Reconciler │────────┘ (leader only) │
//! │        └───────────┘   └────────────┘                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod daemon;
mod error;
mod forward;
mod handler;
pub mod reconciler;
pub mod scheduler;
mod server;
mod tls;
pub mod view;

pub use daemon::{
    Bootstrap, ManagerHandle, init_cluster, load_node_id, run_manager, save_join_material,
    save_node_id,
};
pub use error::{ManagerError, ManagerResult};
pub use handler::{Endpoint, ManagerContext, RequestHandler};
pub use server::ipc_socket_path;
pub use tls::TlsContext;
