//! OS signals as a pollable event source.
//!
//! Tokio's signal driver already does the async-signal-safe part: the real
//! handler only writes to a non-blocking self-pipe. Each watched signal gets
//! a forwarder task that pushes a tag into a small bounded queue with
//! `try_send`, so a burst of signals is coalesced rather than stalling
//! delivery. The agent loop polls [`SignalBridge::recv`] next to the
//! coordinator channel and acts on signals on its own thread.

use std::fmt;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSignal {
    /// Reopen the log destination
    Hangup,
    Interrupt,
    Terminate,
    Quit,
}

impl AgentSignal {
    pub const ALL: [AgentSignal; 4] = [
        AgentSignal::Hangup,
        AgentSignal::Interrupt,
        AgentSignal::Terminate,
        AgentSignal::Quit,
    ];

    fn kind(self) -> SignalKind {
        match self {
            AgentSignal::Hangup => SignalKind::hangup(),
            AgentSignal::Interrupt => SignalKind::interrupt(),
            AgentSignal::Terminate => SignalKind::terminate(),
            AgentSignal::Quit => SignalKind::quit(),
        }
    }

    pub fn is_reload(self) -> bool {
        self == AgentSignal::Hangup
    }
}

impl fmt::Display for AgentSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentSignal::Hangup => "SIGHUP",
            AgentSignal::Interrupt => "SIGINT",
            AgentSignal::Terminate => "SIGTERM",
            AgentSignal::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

/// Everything pending on the signal queue, folded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalBatch {
    /// At least one hang-up was seen
    pub reload: bool,
    /// Last shutdown signal seen, if any
    pub shutdown: Option<AgentSignal>,
}

impl SignalBatch {
    fn record(&mut self, signal: AgentSignal) {
        if signal.is_reload() {
            self.reload = true;
        } else {
            self.shutdown = Some(signal);
        }
    }
}

/// Injects signals into a bridge built with [`SignalBridge::manual`].
#[derive(Debug, Clone)]
pub struct SignalSender(mpsc::Sender<AgentSignal>);

impl SignalSender {
    /// Queue a signal; dropped if the queue is full, like a real one.
    pub fn notify(&self, signal: AgentSignal) {
        let _ = self.0.try_send(signal);
    }
}

pub struct SignalBridge {
    rx: mpsc::Receiver<AgentSignal>,
    forwarders: Vec<JoinHandle<()>>,
}

impl SignalBridge {
    /// Install handlers for SIGHUP, SIGINT, SIGTERM and SIGQUIT.
    pub fn install() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let mut forwarders = Vec::with_capacity(AgentSignal::ALL.len());
        for agent_signal in AgentSignal::ALL {
            let mut stream = signal(agent_signal.kind())?;
            let tx = tx.clone();
            forwarders.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    let _ = tx.try_send(agent_signal);
                }
            }));
        }
        Ok(Self { rx, forwarders })
    }

    /// A bridge fed by hand instead of by the OS.
    pub fn manual() -> (SignalSender, Self) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        (
            SignalSender(tx),
            Self {
                rx,
                forwarders: Vec::new(),
            },
        )
    }

    /// Wait for the next signal. Cancel-safe; never resolves once every sender is gone.
    pub async fn recv(&mut self) -> AgentSignal {
        match self.rx.recv().await {
            Some(signal) => signal,
            None => std::future::pending().await,
        }
    }

    /// Fold `first` and everything already queued into one batch without waiting.
    pub fn drain(&mut self, first: Option<AgentSignal>) -> SignalBatch {
        let mut batch = SignalBatch::default();
        if let Some(signal) = first {
            batch.record(signal);
        }
        while let Ok(signal) = self.rx.try_recv() {
            batch.record(signal);
        }
        batch
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}
