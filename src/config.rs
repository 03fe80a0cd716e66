use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Configuration for launching worker processes.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Worker executable invoked once per job
    pub worker: PathBuf,
    /// Root under which one directory per job id is created
    pub work_root: PathBuf,
    /// Address the worker streams its logs to
    pub log_socket: String,
    /// How long `cancel` waits after SIGTERM before sending SIGKILL
    pub cancel_grace: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            worker: PathBuf::from("lab-worker"),
            work_root: PathBuf::from("/var/lib/lab-agent/jobs"),
            log_socket: "tcp://localhost:5555".to_string(),
            cancel_grace: Duration::from_secs(30),
        }
    }
}

/// TLS configuration for the coordinator channel.
///
/// When enabled the agent authenticates with its own certificate and only
/// accepts a coordinator whose certificate chains to `ca_cert_path`.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the certificate (PEM) that the coordinator must present,
    /// or the CA that signed it.
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this agent's certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to this agent's private key (PEM format).
    pub key_path: Option<PathBuf>,

    /// Name to verify the coordinator certificate against.
    /// Defaults to the host part of the coordinator address.
    pub server_name: Option<String>,
}

/// Tuning for the coordinator connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum number of unsent messages kept while the link is slow or down.
    /// The queue rounds this up to the next power of two.
    pub send_queue_depth: usize,
    /// Base delay before reconnecting after the connection drops
    pub reconnect_delay: Duration,
    /// Upper bound of the random jitter added to `reconnect_delay`
    pub reconnect_jitter: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_queue_depth: 1000,
            reconnect_delay: Duration::from_millis(500),
            reconnect_jitter: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Coordinator address, `host:port` with an optional `tcp://` prefix
    pub coordinator: String,
    /// Name the agent registers under
    pub identity: String,
    /// Upper bound on a single wait for inbound events
    pub poll_timeout: Duration,
    /// Keep-alive probe interval; four missed intervals mark the coordinator offline
    pub ping_interval: Duration,
    pub tls: TlsConfig,
    pub transport: TransportConfig,
    pub job: JobConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            coordinator: "localhost:5556".to_string(),
            identity: "localhost".to_string(),
            poll_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(5),
            tls: TlsConfig::default(),
            transport: TransportConfig::default(),
            job: JobConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(coordinator: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            coordinator: coordinator.into(),
            identity: identity.into(),
            ..Default::default()
        }
    }

    pub fn with_job(mut self, job: JobConfig) -> Self {
        self.job = job;
        self
    }

    /// Coordinator address with any URL scheme stripped, ready for `TcpStream::connect`.
    pub fn coordinator_addr(&self) -> &str {
        self.coordinator
            .strip_prefix("tcp://")
            .unwrap_or(&self.coordinator)
    }

    /// Host part of the coordinator address.
    pub fn coordinator_host(&self) -> &str {
        let addr = self.coordinator_addr();
        // [v6]:port
        if let Some(rest) = addr.strip_prefix('[') {
            return rest.split(']').next().unwrap_or(rest);
        }
        match addr.rsplit_once(':') {
            Some((host, _port)) => host,
            None => addr,
        }
    }
}

/// Reject identities the coordinator cannot route on.
pub fn validate_identity(identity: &str) -> Result<()> {
    let valid = !identity.is_empty()
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(AgentError::InvalidIdentity(identity.to_string()))
    }
}

/// Identity used when none is configured: this host's name.
pub fn default_identity() -> Result<String> {
    let name = hostname::get().map_err(AgentError::Hostname)?;
    Ok(name.to_string_lossy().into_owned())
}
