use std::time::Instant;

use tokio::time::sleep;

use crate::config::{validate_identity, AgentConfig};
use crate::error::{AgentError, Result};
use crate::jobs::{JobManager, WorkerCerts};
use crate::logging::LogDestination;
use crate::protocol::message::HELLO_OK;
use crate::protocol::{Outbound, ProtocolEngine};
use crate::signals::{AgentSignal, SignalBatch, SignalBridge};
use crate::tls::TlsIdentity;
use crate::transport::{Channel, TransportError};

/// What one poll of the event sources produced.
#[derive(Debug, Default)]
struct Polled {
    signals: SignalBatch,
    message: Option<Vec<String>>,
}

/// The agent's single control loop.
///
/// Owns the coordinator channel, the signal bridge and the protocol engine,
/// and is the only place any of them is touched. Startup runs the greeting
/// handshake; after that every iteration:
/// 1. waits up to `poll_timeout` for a signal or one coordinator message
/// 2. reopens the log on hang-up and returns on any other signal
/// 3. dispatches the message, if any
/// 4. reports finished jobs
/// 5. sends a keep-alive if one is due
pub struct Agent {
    config: AgentConfig,
    channel: Channel,
    signals: SignalBridge,
    log: LogDestination,
    engine: ProtocolEngine,
}

impl Agent {
    /// Validate the configuration and bring up every event source.
    ///
    /// # Errors
    ///
    /// Fails on an invalid identity, unreadable TLS material, an unusable
    /// work root, or when signal handlers cannot be installed. None of these
    /// are retried.
    pub async fn new(config: AgentConfig, log: LogDestination) -> Result<Self> {
        validate_identity(&config.identity)?;

        let tls = if config.tls.enabled {
            let identity = TlsIdentity::load(&config.tls, config.coordinator_host()).await?;
            tracing::info!("TLS enabled with mutual authentication");
            Some(identity)
        } else {
            None
        };

        let work_root = &config.job.work_root;
        tokio::fs::create_dir_all(work_root)
            .await
            .map_err(|source| AgentError::WorkDir {
                path: work_root.clone(),
                source,
            })?;

        let signals = SignalBridge::install().map_err(AgentError::Signals)?;
        let channel = Channel::connect(
            config.coordinator_addr(),
            config.identity.clone(),
            &config.transport,
            tls,
        );

        Ok(Self::with_parts(config, channel, signals, log))
    }

    /// Assemble an agent from already-built event sources.
    pub fn with_parts(
        config: AgentConfig,
        channel: Channel,
        signals: SignalBridge,
        log: LogDestination,
    ) -> Self {
        let jobs = JobManager::new(config.job.clone())
            .with_certs(WorkerCerts::from_tls(&config.tls));
        Self {
            engine: ProtocolEngine::new(jobs, Instant::now()),
            config,
            channel,
            signals,
            log,
        }
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// Greet the coordinator, then serve it until a shutdown signal.
    ///
    /// Returns `Ok` for a signal-requested shutdown. The channel is released
    /// without flushing.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            identity = %self.config.identity,
            coordinator = %self.config.coordinator,
            "Starting agent"
        );

        if let Some(signal) = self.handshake().await? {
            return self.shutdown(signal);
        }

        loop {
            let polled = self.poll().await?;

            if polled.signals.reload {
                self.reload_log();
            }
            if let Some(signal) = polled.signals.shutdown {
                return self.shutdown(signal);
            }

            if let Some(frames) = polled.message {
                let replies = self.engine.handle(&frames, Instant::now()).await;
                self.send_all(replies);
            }

            let finished = self.engine.reap();
            self.send_all(finished);

            if let Some(ping) = self
                .engine
                .maybe_ping(Instant::now(), self.config.ping_interval)
            {
                self.send(ping);
            }
        }
    }

    /// Send `HELLO` until the coordinator answers with `HELLO_OK`.
    ///
    /// Returns the shutdown signal if one arrived first.
    pub async fn handshake(&mut self) -> Result<Option<AgentSignal>> {
        self.send(Outbound::Hello);
        loop {
            let polled = self.poll().await?;

            if polled.signals.reload {
                self.reload_log();
            }
            if let Some(signal) = polled.signals.shutdown {
                return Ok(Some(signal));
            }

            match polled.message {
                Some(frames) if frames.first().map(String::as_str) == Some(HELLO_OK) => {
                    tracing::info!("Coordinator accepted greeting");
                    self.engine.mark_alive(Instant::now());
                    return Ok(None);
                }
                Some(frames) => {
                    tracing::warn!(
                        action = frames.first().map(String::as_str).unwrap_or(""),
                        "Unexpected reply to greeting, retrying"
                    );
                    self.send(Outbound::HelloRetry);
                }
                None if polled.signals.reload => {}
                None => {
                    tracing::debug!("No reply to greeting, retrying");
                    self.send(Outbound::HelloRetry);
                }
            }
        }
    }

    /// Wait for a signal, one coordinator message or the poll timeout,
    /// whichever comes first, then drain any queued signals.
    async fn poll(&mut self) -> Result<Polled> {
        let mut polled = Polled::default();
        let first = tokio::select! {
            signal = self.signals.recv() => Some(signal),
            message = self.channel.recv() => {
                match message {
                    Ok(frames) => polled.message = Some(frames),
                    Err(TransportError::Closed) => {
                        tracing::error!("Coordinator channel closed unexpectedly");
                        return Err(TransportError::Closed.into());
                    }
                }
                None
            }
            _ = sleep(self.config.poll_timeout) => None,
        };
        polled.signals = self.signals.drain(first);
        Ok(polled)
    }

    fn reload_log(&self) {
        match self.log.reopen() {
            Ok(()) => tracing::info!("Reopened log destination"),
            Err(e) => tracing::error!(error = %e, "Failed to reopen log destination"),
        }
    }

    fn shutdown(self, signal: AgentSignal) -> Result<()> {
        tracing::info!(%signal, "Shutting down");
        self.channel.close();
        Ok(())
    }

    fn send_all(&self, messages: Vec<Outbound>) {
        for message in messages {
            self.send(message);
        }
    }

    fn send(&self, message: Outbound) {
        tracing::debug!(%message, "Sending");
        if let Err(e) = self.channel.send(message.encode()) {
            tracing::warn!(error = %e, %message, "Failed to queue message");
        }
    }
}
