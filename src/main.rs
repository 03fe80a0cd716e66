use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use lab_agent::config::{default_identity, AgentConfig, JobConfig, TlsConfig, TransportConfig};
use lab_agent::logging::{self, LogDestination};
use lab_agent::Agent;

#[derive(Parser, Debug)]
#[command(name = "lab-agent")]
#[command(version)]
#[command(about = "Runs test jobs on this host on behalf of a lab coordinator")]
struct Args {
    /// Coordinator address (host:port, optionally prefixed with tcp://)
    #[arg(long, default_value = "localhost:5556")]
    coordinator: String,

    /// Name to register under. Defaults to this host's name.
    #[arg(long)]
    hostname: Option<String>,

    /// Append logs to this file instead of stderr. Reopened on SIGHUP.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, value_enum, default_value = "info")]
    level: LogLevel,

    /// Upper bound on one wait for coordinator traffic, in milliseconds
    #[arg(long, default_value = "5000")]
    poll_timeout_ms: u64,

    /// Keep-alive interval in milliseconds
    #[arg(long, default_value = "5000")]
    ping_interval_ms: u64,

    // === TLS Options ===
    /// Encrypt and mutually authenticate the coordinator connection
    #[arg(long)]
    encrypt: bool,

    /// Certificate (PEM) the coordinator must present, or its CA
    #[arg(long, requires = "encrypt")]
    ca_cert: Option<PathBuf>,

    /// Agent certificate (PEM format)
    #[arg(long, requires = "encrypt")]
    cert: Option<PathBuf>,

    /// Agent private key (PEM format)
    #[arg(long, requires = "encrypt")]
    key: Option<PathBuf>,

    /// Name to verify the coordinator certificate against
    #[arg(long, requires = "encrypt")]
    tls_server_name: Option<String>,

    // === Job Options ===
    /// Worker executable started for each job
    #[arg(long, default_value = "lab-worker")]
    worker: PathBuf,

    /// Directory holding one subdirectory per job
    #[arg(long, default_value = "/var/lib/lab-agent/jobs")]
    work_dir: PathBuf,

    /// Address workers send their logs to
    #[arg(long, default_value = "tcp://localhost:5555")]
    log_socket: String,

    /// Time a cancelled worker gets after SIGTERM before SIGKILL, in milliseconds
    #[arg(long, default_value = "30000")]
    cancel_grace_ms: u64,

    /// Maximum number of unsent messages kept while the coordinator is unreachable
    /// (rounded up to a power of two)
    #[arg(long, default_value = "1000")]
    send_queue_depth: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log = match &args.log_file {
        Some(path) => LogDestination::file(path)
            .map_err(|e| format!("Cannot open log file {}: {}", path.display(), e))?,
        None => LogDestination::stderr(),
    };
    logging::init(args.level.as_str(), log.clone());

    let identity = match args.hostname {
        Some(name) => name,
        None => default_identity()?,
    };

    let config = AgentConfig {
        coordinator: args.coordinator,
        identity,
        poll_timeout: Duration::from_millis(args.poll_timeout_ms),
        ping_interval: Duration::from_millis(args.ping_interval_ms),
        tls: TlsConfig {
            enabled: args.encrypt,
            ca_cert_path: args.ca_cert,
            cert_path: args.cert,
            key_path: args.key,
            server_name: args.tls_server_name,
        },
        transport: TransportConfig {
            send_queue_depth: args.send_queue_depth,
            ..TransportConfig::default()
        },
        job: JobConfig {
            worker: args.worker,
            work_root: args.work_dir,
            log_socket: args.log_socket,
            cancel_grace: Duration::from_millis(args.cancel_grace_ms),
        },
    };

    let agent = match Agent::new(config, log).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!(error = %e, "Agent failed to start");
            return Err(e.into());
        }
    };

    if let Err(e) = agent.run().await {
        tracing::error!(error = %e, "Agent stopped");
        return Err(e.into());
    }
    Ok(())
}
