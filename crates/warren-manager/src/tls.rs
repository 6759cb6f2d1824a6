//! TLS for the RPC surface: mutual authentication both ways.
//!
//! Node identity material is issued outside the core; this module loads
//! PEM files named in configuration and builds the rustls machinery. The
//! acceptor requires a client certificate signed by the cluster CA; the
//! connector presents our own certificate when forwarding to the leader.
//! With no TLS section configured the RPC surface runs over plain TCP
//! (development mode).

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use warren_config::TlsSection;

use crate::error::{ManagerError, ManagerResult};

/// Assembled TLS machinery for one manager.
#[derive(Clone)]
pub struct TlsContext {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
    /// The CA PEM verbatim, handed to joining nodes.
    pub ca_pem: String,
}

/// Builds the TLS context from configuration, or `None` when TLS is not
/// configured. Partial configuration was already rejected at load.
pub fn build(section: &TlsSection) -> ManagerResult<Option<TlsContext>> {
    let (Some(ca), Some(cert), Some(key)) = (
        section.ca_file.as_ref(),
        section.cert_file.as_ref(),
        section.key_file.as_ref(),
    ) else {
        return Ok(None);
    };

    let ca_pem = std::fs::read_to_string(ca)?;
    let ca_certs = load_certs(ca)?;
    let certs = load_certs(cert)?;
    let key = load_key(key)?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .map_err(|e| ManagerError::Internal(format!("bad CA certificate: {e}")))?;
    }
    let roots = Arc::new(roots);

    let verifier = WebPkiClientVerifier::builder(Arc::clone(&roots))
        .build()
        .map_err(|e| ManagerError::Internal(format!("client verifier: {e}")))?;
    let server_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs.clone(), key.clone_key())
        .map_err(|e| ManagerError::Internal(format!("server tls: {e}")))?;

    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(Arc::clone(&roots))
        .with_client_auth_cert(certs, key)
        .map_err(|e| ManagerError::Internal(format!("client tls: {e}")))?;

    Ok(Some(TlsContext {
        acceptor: TlsAcceptor::from(Arc::new(server_config)),
        connector: TlsConnector::from(Arc::new(client_config)),
        ca_pem,
    }))
}

fn load_certs(path: &Path) -> ManagerResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ManagerError::Internal(format!("{}: {e}", path.display())))
}

fn load_key(path: &Path) -> ManagerResult<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| ManagerError::Internal(format!("{}: {e}", path.display())))?
        .ok_or_else(|| ManagerError::Internal(format!("no private key in {}", path.display())))
}
