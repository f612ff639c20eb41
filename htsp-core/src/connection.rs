//! The connection engine: one task owning the socket, a lifecycle
//! state machine, and connection-state listener fan-out.
//!
//! ```text
//!  Closed ──start──► Connecting ──socket up──► Connected
//!                        │                        │
//!                        │ connect/DNS error      │ I/O error, framing
//!                        ▼                        ▼ error, peer close
//!                      Failed ◄───────────────────┘
//!
//!  Connecting/Connected ──close()──► Closing ──► Closed
//! ```
//!
//! `Closed` and `Failed` are terminal for one engine; the supervisor
//! constructs a fresh engine to reconnect. All socket I/O, framing,
//! and inline listener fan-out happen on the single spawned I/O task;
//! `close()` and the dispatcher's sends may come from any task.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::codec::HtspCodec;
use crate::config::ClientConfig;
use crate::dispatcher::HtspMessageDispatcher;
use crate::error::HtspError;
use crate::handler::{Handler, ListenerSet};

// ── ConnectionState ──────────────────────────────────────────────

/// Lifecycle state of one connection engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, and terminal state after a clean close.
    Closed,
    /// TCP connect in flight.
    Connecting,
    /// Socket up; traffic flowing.
    Connected,
    /// Graceful shutdown in progress.
    Closing,
    /// Terminal state after any I/O or framing error.
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Terminal for this engine run.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    pub fn is_closed_or_closing(&self) -> bool {
        self.is_closed() || matches!(self, Self::Closing)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "Closed",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Closing => "Closing",
            Self::Failed => "Failed",
        };
        write!(f, "{name}")
    }
}

// ── ConnectionListener ───────────────────────────────────────────

/// Observes every connection state transition.
pub trait ConnectionListener: Send + Sync {
    fn handler(&self) -> Option<Handler> {
        None
    }

    fn on_connection_state(&self, state: ConnectionState);
}

// ── HtspConnection ───────────────────────────────────────────────

/// One run of the connection engine.
pub struct HtspConnection {
    config: ClientConfig,
    dispatcher: Arc<HtspMessageDispatcher>,
    /// Shared with the supervisor so registrations survive reconnects.
    listeners: Arc<ListenerSet<dyn ConnectionListener>>,
    state: Mutex<ConnectionState>,
    shutdown: CancellationToken,
    ever_connected: AtomicBool,
}

impl HtspConnection {
    pub fn new(
        config: ClientConfig,
        dispatcher: Arc<HtspMessageDispatcher>,
        listeners: Arc<ListenerSet<dyn ConnectionListener>>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            listeners,
            state: Mutex::new(ConnectionState::Closed),
            shutdown: CancellationToken::new(),
            ever_connected: AtomicBool::new(false),
        }
    }

    /// Launch the I/O task. One engine runs exactly once.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(engine.run())
    }

    /// Request a graceful shutdown. Wakes the I/O task; the engine
    /// transitions through Closing to Closed.
    pub fn close(&self) {
        tracing::info!("closing HTSP connection");
        self.shutdown.cancel();
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Whether this run ever reached Connected (backoff reset input).
    pub fn ever_connected(&self) -> bool {
        self.ever_connected.load(Ordering::SeqCst)
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.remove(listener);
    }

    // ── I/O task ──────────────────────────────────────────────────

    async fn run(self: Arc<Self>) {
        tracing::debug!("started task 'connection'");
        self.set_state(ConnectionState::Connecting);

        let framed = tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.set_state(ConnectionState::Closing);
                self.set_state(ConnectionState::Closed);
                return;
            }
            result = self.open_socket() => match result {
                Ok(framed) => framed,
                Err(e) => {
                    tracing::error!(error = %e, "failed to open connection");
                    self.set_state(ConnectionState::Failed);
                    return;
                }
            },
        };

        // The outbound queue must be attached before listeners hear
        // about Connected, so they can send from the callback.
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        self.dispatcher.attach(outbound_tx);
        self.ever_connected.store(true, Ordering::SeqCst);
        tracing::info!("HTSP connected");
        self.set_state(ConnectionState::Connected);

        let (mut sink, mut stream) = framed.split();

        let final_state = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.set_state(ConnectionState::Closing);
                    break ConnectionState::Closed;
                }
                outbound = outbound_rx.recv() => match outbound {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            tracing::error!(error = %e, "write failed");
                            break ConnectionState::Failed;
                        }
                    }
                    // The dispatcher only detaches during teardown.
                    None => break ConnectionState::Failed,
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(message)) => self.dispatcher.on_message(message),
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "read failed");
                        break ConnectionState::Failed;
                    }
                    None => {
                        tracing::info!("connection closed by server");
                        break ConnectionState::Failed;
                    }
                },
            }
        };

        // Teardown order: wake blocked callers and clear queued
        // messages first, then drop the socket, then tell listeners.
        self.dispatcher.detach();
        drop(sink);
        drop(stream);
        self.set_state(final_state);
        tracing::debug!("completed task 'connection'");
    }

    async fn open_socket(&self) -> Result<Framed<TcpStream, HtspCodec>, HtspError> {
        let addr = self.config.server_addr();
        tracing::info!(%addr, "opening HTSP connection");

        let mut resolved = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| HtspError::UnresolvedAddress(format!("{addr}: {e}")))?;
        let target = resolved
            .next()
            .ok_or_else(|| HtspError::UnresolvedAddress(addr.clone()))?;

        let stream = tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(target),
        )
        .await
        .map_err(|_| {
            HtspError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })??;

        stream.set_nodelay(true)?;
        Ok(Framed::new(stream, HtspCodec::new()))
    }

    fn set_state(&self, state: ConnectionState) {
        {
            let mut current = self.state.lock().unwrap();
            if *current == state {
                return;
            }
            tracing::debug!(from = %current, to = %state, "connection state change");
            *current = state;
        }

        for listener in self.listeners.snapshot() {
            match listener.handler() {
                Some(handler) => {
                    let listener = listener.clone();
                    handler.post(Box::new(move || listener.on_connection_state(state)));
                }
                None => {
                    let delivery =
                        catch_unwind(AssertUnwindSafe(|| listener.on_connection_state(state)));
                    if delivery.is_err() {
                        tracing::error!("connection listener panicked, continuing");
                    }
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
