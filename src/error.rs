use thiserror::Error;

use crate::tls::TlsError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid agent identity {0:?}: must match [-_a-zA-Z0-9.]+")]
    InvalidIdentity(String),

    #[error("Unable to determine host name: {0}")]
    Hostname(std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to install signal handlers: {0}")]
    Signals(std::io::Error),

    #[error("Cannot prepare work directory {path}: {source}")]
    WorkDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, AgentError>;
