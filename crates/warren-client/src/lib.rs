//! # warren-client: RPC client for Warren managers
//!
//! An async client speaking the `warren-wire` protocol over TCP, mTLS, or
//! the local read-only Unix socket.
//!
//! ```ignore
//! use warren_client::{Client, ClientConfig};
//!
//! let mut client = Client::connect("127.0.0.1:7421", ClientConfig::default()).await?;
//! let services = client.list_services().await?;
//!
//! // Writes that land on a follower are retried once against the hinted
//! // leader.
//! let service = client.create_service(spec).await?;
//! ```

mod client;
mod error;
mod tls;

pub use client::{Client, ClientConfig};
pub use error::{ClientError, ClientResult};
pub use tls::ClientTls;

// Shapes callers need alongside the client.
pub use warren_wire::{ClusterInfo, ContainerFilter, ErrorBody, ErrorKind, SecretInfo, StateReport};
