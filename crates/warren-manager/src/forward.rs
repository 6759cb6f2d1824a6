//! Leader forwarding: replay a write envelope against the hinted leader.
//!
//! The envelope travels unchanged, request id included, so the command
//! still applies at most once even if the caller later retries on its
//! own.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use warren_wire::{Response, RequestEnvelope, read_frame, write_frame};

use crate::error::{ManagerError, ManagerResult};

/// Deadline for the full forwarded round trip.
const FORWARD_DEADLINE: Duration = Duration::from_secs(10);

/// Sends `envelope` to the leader at `addr` and returns its response.
pub async fn to_leader(
    addr: &str,
    envelope: &RequestEnvelope,
    tls: Option<&TlsConnector>,
) -> ManagerResult<Response> {
    tokio::time::timeout(FORWARD_DEADLINE, roundtrip(addr, envelope, tls))
        .await
        .map_err(|_| ManagerError::Log(warren_log::LogError::ApplyTimeout))?
}

async fn roundtrip(
    addr: &str,
    envelope: &RequestEnvelope,
    tls: Option<&TlsConnector>,
) -> ManagerResult<Response> {
    let tcp = TcpStream::connect(addr).await?;
    debug!(%addr, "forward connection established");

    match tls {
        Some(connector) => {
            let host = addr.split(':').next().unwrap_or(addr).to_string();
            let name = rustls::pki_types::ServerName::try_from(host)
                .map_err(|e| ManagerError::Internal(format!("bad leader host: {e}")))?;
            let mut stream = connector
                .connect(name, tcp)
                .await
                .map_err(ManagerError::Io)?;
            write_frame(&mut stream, envelope)
                .await
                .map_err(wire_to_manager)?;
            read_frame(&mut stream).await.map_err(wire_to_manager)
        }
        None => {
            let mut stream = tcp;
            write_frame(&mut stream, envelope)
                .await
                .map_err(wire_to_manager)?;
            read_frame(&mut stream).await.map_err(wire_to_manager)
        }
    }
}

fn wire_to_manager(error: warren_wire::WireError) -> ManagerError {
    match error {
        warren_wire::WireError::Io(e) => ManagerError::Io(e),
        other => ManagerError::Internal(other.to_string()),
    }
}
