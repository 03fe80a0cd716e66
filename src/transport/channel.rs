use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, MultipartCodec};
use super::TransportError;
use crate::config::TransportConfig;
use crate::tls::TlsIdentity;

const INBOUND_DEPTH: usize = 64;

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Identity-tagged, message-oriented link to the coordinator.
///
/// A background task owns the socket and reconnects whenever it drops, so
/// callers only ever see a stream of whole messages. Outbound messages go
/// through a bounded queue: when it overflows the oldest unsent messages
/// are discarded and `send` never blocks.
pub struct Channel {
    outbound: broadcast::Sender<Vec<String>>,
    inbound: mpsc::Receiver<Vec<String>>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Channel {
    /// Start connecting to `address` as `identity`. Returns immediately.
    pub fn connect(
        address: impl Into<String>,
        identity: impl Into<String>,
        config: &TransportConfig,
        tls: Option<TlsIdentity>,
    ) -> Self {
        let (outbound, outbound_rx) = broadcast::channel(config.send_queue_depth.max(1));
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_DEPTH);
        let shutdown = CancellationToken::new();

        let link = Link {
            address: address.into(),
            identity: identity.into(),
            tls,
            reconnect_delay: config.reconnect_delay,
            reconnect_jitter: config.reconnect_jitter,
        };
        let task = tokio::spawn(link.run(outbound_rx, inbound_tx, shutdown.clone()));

        Self {
            outbound,
            inbound,
            shutdown,
            task,
        }
    }

    /// Queue a message for delivery.
    pub fn send(&self, frames: Vec<String>) -> Result<(), TransportError> {
        self.outbound
            .send(frames)
            .map(|_| ())
            .map_err(|_| TransportError::Closed)
    }

    /// Wait for the next inbound message. Cancel-safe.
    pub async fn recv(&mut self) -> Result<Vec<String>, TransportError> {
        self.inbound.recv().await.ok_or(TransportError::Closed)
    }

    /// Tear the link down, dropping anything still queued.
    pub fn close(self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Link {
    address: String,
    identity: String,
    tls: Option<TlsIdentity>,
    reconnect_delay: Duration,
    reconnect_jitter: Duration,
}

impl Link {
    async fn run(
        self,
        mut outbound: broadcast::Receiver<Vec<String>>,
        inbound: mpsc::Sender<Vec<String>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let io = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = self.open() => result,
            };

            match io {
                Ok(io) => {
                    tracing::info!(
                        address = %self.address,
                        identity = %self.identity,
                        "Connected to coordinator"
                    );
                    let framed = Framed::new(io, MultipartCodec);
                    if self
                        .serve(framed, &mut outbound, &inbound, &shutdown)
                        .await
                        .is_break()
                    {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        address = %self.address,
                        error = %e,
                        "Unable to reach coordinator"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.backoff()) => {}
            }
        }
    }

    async fn open(&self) -> std::io::Result<Box<dyn Io>> {
        let tcp = TcpStream::connect(&self.address).await?;
        tcp.set_nodelay(true)?;
        match &self.tls {
            Some(tls) => {
                let stream = tls.connector().connect(tls.server_name(), tcp).await?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(tcp)),
        }
    }

    /// Pump messages over one connection. `Break` means the channel is shutting down.
    async fn serve(
        &self,
        mut framed: Framed<Box<dyn Io>, MultipartCodec>,
        outbound: &mut broadcast::Receiver<Vec<String>>,
        inbound: &mpsc::Sender<Vec<String>>,
        shutdown: &CancellationToken,
    ) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow::{Break, Continue};

        if let Err(e) = framed.send(vec![self.identity.clone()]).await {
            tracing::warn!(error = %e, "Failed to announce identity");
            return Continue(());
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Break(()),

                message = outbound.recv() => match message {
                    Ok(frames) => match framed.send(frames).await {
                        Ok(()) => {}
                        Err(CodecError::Io(e)) => {
                            tracing::warn!(error = %e, "Send to coordinator failed, reconnecting");
                            return Continue(());
                        }
                        // Rejected before anything was written; the link is intact
                        Err(e) => {
                            tracing::error!(error = %e, "Dropping message that cannot be encoded");
                        }
                    },
                    Err(RecvError::Lagged(dropped)) => {
                        tracing::warn!(dropped, "Send queue overflow, oldest messages dropped");
                    }
                    Err(RecvError::Closed) => return Break(()),
                },

                message = framed.next() => match message {
                    Some(Ok(frames)) => {
                        if inbound.send(frames).await.is_err() {
                            return Break(());
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Invalid data from coordinator, reconnecting");
                        return Continue(());
                    }
                    None => {
                        tracing::warn!(
                            address = %self.address,
                            "Coordinator closed the connection"
                        );
                        return Continue(());
                    }
                },
            }
        }
    }

    fn backoff(&self) -> Duration {
        let jitter_ms = self.reconnect_jitter.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        self.reconnect_delay + Duration::from_millis(jitter)
    }
}
