//! The RPC server: network listener plus the local IPC socket.
//!
//! Connections are sequential request/response. Each accepted connection
//! gets its own task; handlers only read the store or submit commands, so
//! any number of them run concurrently against the single log runtime.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use warren_wire::{RequestEnvelope, Response, WireError, read_frame, write_frame};

use crate::error::ManagerResult;
use crate::handler::{Endpoint, RequestHandler};
use crate::tls::TlsContext;

/// Serves the network RPC endpoint until `shutdown` flips.
pub async fn serve_network(
    listener: TcpListener,
    handler: RequestHandler,
    tls: Option<TlsContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        addr = ?listener.local_addr().ok(),
        tls = tls.is_some(),
        "rpc listener ready"
    );
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(error) => {
                        warn!(%error, "accept failed");
                        continue;
                    }
                };
                debug!(%addr, "connection accepted");
                let handler = handler.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls {
                        Some(tls) => match tls.acceptor.accept(stream).await {
                            Ok(stream) => {
                                connection_loop(stream, handler, Endpoint::Network).await;
                            }
                            Err(error) => debug!(%addr, %error, "tls handshake failed"),
                        },
                        None => connection_loop(stream, handler, Endpoint::Network).await,
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("rpc listener stopping");
                return;
            }
        }
    }
}

/// Serves the read-only IPC endpoint on a Unix socket inside the data
/// directory. Filesystem permissions are the access control.
#[cfg(unix)]
pub async fn serve_ipc(
    socket_path: PathBuf,
    handler: RequestHandler,
    mut shutdown: watch::Receiver<bool>,
) -> ManagerResult<()> {
    use std::os::unix::fs::PermissionsExt;

    // A previous unclean shutdown may have left the socket behind.
    let _ = std::fs::remove_file(&socket_path);
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = tokio::net::UnixListener::bind(&socket_path)?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o700))?;
    info!(path = %socket_path.display(), "ipc listener ready");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let handler = handler.clone();
                tokio::spawn(async move {
                    connection_loop(stream, handler, Endpoint::LocalReadOnly).await;
                });
            }
            _ = shutdown.changed() => {
                let _ = std::fs::remove_file(&socket_path);
                return Ok(());
            }
        }
    }
}

/// One connection: envelopes in, responses out, until EOF.
async fn connection_loop<S>(mut stream: S, handler: RequestHandler, endpoint: Endpoint)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let envelope: RequestEnvelope = match read_frame(&mut stream).await {
            Ok(envelope) => envelope,
            Err(WireError::ConnectionClosed) => return,
            Err(error) => {
                debug!(%error, "dropping undecodable connection");
                return;
            }
        };

        let response: Response = handler.handle(envelope, endpoint).await;
        if let Err(error) = write_frame(&mut stream, &response).await {
            debug!(%error, "response write failed");
            return;
        }
    }
}

/// The IPC socket path inside a data directory.
pub fn ipc_socket_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("warren.sock")
}
