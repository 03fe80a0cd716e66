//! Key material for the encrypted coordinator channel.
//!
//! The agent authenticates with its own certificate/key pair and pins the
//! coordinator to a configured certificate (or the CA that issued it).
//! Any problem loading this material is fatal at startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::fs;
use tokio_rustls::TlsConnector;

use crate::config::TlsConfig;

/// Error type for TLS configuration issues.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Coordinator certificate path not configured")]
    MissingCaCert,

    #[error("Agent certificate path not configured")]
    MissingCert,

    #[error("Private key path not configured")]
    MissingKey,

    #[error("Coordinator certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Agent certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("No PEM certificate in {0}")]
    NoCertificates(PathBuf),

    #[error("No PEM private key in {0}")]
    NoPrivateKey(PathBuf),

    #[error("Invalid TLS server name {0:?}")]
    InvalidServerName(String),

    #[error("TLS setup failed: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Loaded TLS materials ready for use with tokio-rustls.
#[derive(Clone)]
pub struct TlsIdentity {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsIdentity {
    /// Load TLS materials from file paths specified in the config.
    ///
    /// `default_server_name` is used when the config does not name the
    /// coordinator explicitly.
    pub async fn load(config: &TlsConfig, default_server_name: &str) -> Result<Self, TlsError> {
        let ca_cert_path = config
            .ca_cert_path
            .as_ref()
            .ok_or(TlsError::MissingCaCert)?;
        let cert_path = config.cert_path.as_ref().ok_or(TlsError::MissingCert)?;
        let key_path = config.key_path.as_ref().ok_or(TlsError::MissingKey)?;

        if !ca_cert_path.exists() {
            return Err(TlsError::CaCertNotFound(ca_cert_path.clone()));
        }
        if !cert_path.exists() {
            return Err(TlsError::CertNotFound(cert_path.clone()));
        }
        if !key_path.exists() {
            return Err(TlsError::KeyNotFound(key_path.clone()));
        }

        let mut roots = RootCertStore::empty();
        for cert in read_certs(ca_cert_path).await? {
            roots.add(cert)?;
        }
        let certs = read_certs(cert_path).await?;
        let key = read_key(key_path).await?;

        let client_config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;

        let name = config
            .server_name
            .clone()
            .unwrap_or_else(|| default_server_name.to_string());
        let server_name =
            ServerName::try_from(name.clone()).map_err(|_| TlsError::InvalidServerName(name))?;

        Ok(Self {
            config: Arc::new(client_config),
            server_name,
        })
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }

    pub fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

async fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = fs::read(path).await?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice()).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

async fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = fs::read(path).await?;
    rustls_pemfile::private_key(&mut pem.as_slice())?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}
