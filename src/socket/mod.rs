//! Socket adapters: a byte stream bound to a frame protocol.
//!
//! # Data Flow
//! ```text
//! Socket::connect(options, existing?)
//!     → spawned driver task
//!         dial (client) or adopt (remote)
//!         → ws.rs handshake | http.rs (none)
//!         → driver.rs loop: read → Protocol::receive → SocketEvent::Receive
//!                           Command::Send → Protocol::send → write
//!     → SocketEvent stream consumed by the tunnel
//! ```
//!
//! # Design Decisions
//! - One task owns the stream; the handle only sends commands
//! - The driver is generic over `AsyncRead + AsyncWrite`, so in-memory
//!   duplex pipes exercise the same code as TCP
//! - Every exit path emits exactly one `Disconnect`

mod driver;
mod http;
mod ws;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::codec::{Codec, HeaderMap};
use crate::config::{Transport, TunnelConfig};
use crate::protocol::ws::handshake::HandshakeError;
use crate::protocol::{CloseStatus, Role};

/// Everything a socket needs to dial, handshake and frame.
#[derive(Clone)]
pub struct SocketOptions {
    pub host: String,
    pub port: u16,
    pub role: Role,
    pub transport: Transport,
    pub codec: Arc<dyn Codec>,
    pub origin: String,
    /// Client keepalive period; `None` disables pings.
    pub keepalive: Option<Duration>,
    /// Silence after which the connection is dropped.
    pub idle_timeout: Option<Duration>,
    pub max_message_bytes: usize,
}

impl SocketOptions {
    pub fn from_config(config: &TunnelConfig, role: Role, codec: Arc<dyn Codec>) -> Self {
        let seconds = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        Self {
            host: config.host.clone(),
            port: config.port,
            role,
            transport: config.transport,
            codec,
            origin: config.origin.clone(),
            keepalive: seconds(config.keepalive_secs),
            idle_timeout: seconds(config.idle_timeout_secs),
            max_message_bytes: config.max_message_bytes,
        }
    }
}

impl std::fmt::Debug for SocketOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("role", &self.role)
            .field("transport", &self.transport)
            .field("codec", &self.codec.name())
            .finish_non_exhaustive()
    }
}

/// Transport-level failure. Always followed by a `Disconnect`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("protocol violation, closed with {0}")]
    Protocol(CloseStatus),
    #[error("connection timed out")]
    Timeout,
}

/// What a socket reports to its owner.
#[derive(Debug)]
pub enum SocketEvent {
    /// Handshake finished; `send` now succeeds.
    Connect,
    Receive { payload: Vec<u8>, headers: HeaderMap },
    Error(TransportError),
    Disconnect,
}

#[derive(Debug)]
pub(crate) enum Command {
    Send { payload: Vec<u8>, headers: HeaderMap },
    Disconnect,
}

/// Handle to a running socket driver.
#[derive(Debug, Clone)]
pub struct Socket {
    commands: mpsc::UnboundedSender<Command>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

pub type SocketEvents = mpsc::UnboundedReceiver<SocketEvent>;

impl Socket {
    /// Adapt `existing` (remote role) or dial `options.host:port` (client role).
    pub fn connect(options: SocketOptions, existing: Option<TcpStream>) -> (Socket, SocketEvents) {
        match existing {
            Some(stream) => Self::attach(options, stream),
            None => {
                let address = (options.host.clone(), options.port);
                Self::spawn(options, async move { TcpStream::connect(address).await })
            }
        }
    }

    /// Run the socket over an already open stream.
    pub fn attach<S>(options: SocketOptions, stream: S) -> (Socket, SocketEvents)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(options, async move { Ok(stream) })
    }

    fn spawn<S, F>(options: SocketOptions, dial: F) -> (Socket, SocketEvents)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = std::io::Result<S>> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(driver::run(
            options,
            dial,
            command_rx,
            event_tx,
            Arc::clone(&connected),
        ));

        let socket = Socket {
            commands: command_tx,
            connected,
            closing: Arc::new(AtomicBool::new(false)),
        };
        (socket, event_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closing.load(Ordering::SeqCst)
    }

    /// Queue a payload. `false` when the socket is not connected.
    pub fn send(&self, payload: Vec<u8>, headers: HeaderMap) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.commands.send(Command::Send { payload, headers }).is_ok()
    }

    /// Begin teardown. Only the first call has an effect.
    pub fn disconnect(&self) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.commands.send(Command::Disconnect).is_ok()
    }
}
