//! Client-side TLS: mutual authentication against the cluster CA.
//!
//! Node identity material (certificate + key) is issued externally; this
//! module only loads PEM files from disk and builds a rustls config.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::TlsConnector;

use crate::error::{ClientError, ClientResult};

/// mTLS material for client connections.
#[derive(Clone)]
pub struct ClientTls {
    connector: TlsConnector,
}

impl ClientTls {
    /// Builds a connector from PEM files: the cluster CA plus this node's
    /// certificate and key.
    pub fn from_pem_files(ca: &Path, cert: &Path, key: &Path) -> ClientResult<Self> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(ca)? {
            roots
                .add(cert)
                .map_err(|e| ClientError::Tls(e.to_string()))?;
        }

        let certs = load_certs(cert)?;
        let key = load_key(key)?;

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| ClientError::Tls(e.to_string()))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Wraps a TCP stream in TLS.
    pub async fn connect(
        &self,
        server_name: &str,
        stream: tokio::net::TcpStream,
    ) -> ClientResult<tokio_rustls::client::TlsStream<tokio::net::TcpStream>> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        self.connector
            .connect(name, stream)
            .await
            .map_err(|e| ClientError::Tls(e.to_string()))
    }
}

pub(crate) fn load_certs(path: &Path) -> ClientResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).map_err(|e| ClientError::Tls(format!("{}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Tls(e.to_string()))
}

pub(crate) fn load_key(path: &Path) -> ClientResult<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).map_err(|e| ClientError::Tls(format!("{}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| ClientError::Tls(e.to_string()))?
        .ok_or_else(|| ClientError::Tls(format!("no private key in {}", path.display())))
}
