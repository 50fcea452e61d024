//! The per-connection task behind a [`Socket`](super::Socket).
//!
//! # Data Flow
//! ```text
//! setup:  dial → handshake         (raced against Command::Disconnect)
//! loop:   stream.read    → Protocol::receive → replies written, chunks emitted
//!         Command::Send  → Protocol::send    → write
//!         keepalive tick → Protocol::keepalive
//!         idle deadline  → TransportError::Timeout
//! exit:   shutdown stream → SocketEvent::Disconnect (exactly once)
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::Transport;
use crate::observability::metrics;
use crate::protocol::{CloseStatus, Closure, Protocol, Role};
use crate::socket::{http, ws, Command, SocketEvent, SocketOptions, TransportError};

const READ_BUFFER_BYTES: usize = 16 * 1024;

pub(crate) type Established<S> = (S, Box<dyn Protocol>, Vec<u8>);

pub(super) async fn run<S, F>(
    options: SocketOptions,
    dial: F,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SocketEvent>,
    connected: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    F: Future<Output = std::io::Result<S>> + Send,
{
    let setup = async {
        let stream = dial.await.map_err(TransportError::Connect)?;
        establish(&options, stream).await
    };

    let established = tokio::select! {
        result = setup => result,
        _ = wait_for_disconnect(&mut commands) => {
            tracing::debug!(host = %options.host, port = options.port, "Disconnected during setup");
            let _ = events.send(SocketEvent::Disconnect);
            return;
        }
    };

    let (stream, protocol, leftover) = match established {
        Ok(established) => established,
        Err(error) => {
            tracing::warn!(
                host = %options.host,
                port = options.port,
                role = %options.role,
                error = %error,
                "Socket setup failed"
            );
            let _ = events.send(SocketEvent::Error(error));
            let _ = events.send(SocketEvent::Disconnect);
            return;
        }
    };

    tracing::debug!(
        host = %options.host,
        port = options.port,
        role = %options.role,
        protocol = protocol.name(),
        "Socket connected"
    );
    connected.store(true, Ordering::SeqCst);
    metrics::connection_opened();
    let _ = events.send(SocketEvent::Connect);

    drive(stream, protocol, leftover, &options, &mut commands, &events).await;

    connected.store(false, Ordering::SeqCst);
    metrics::connection_closed();
    tracing::debug!(host = %options.host, port = options.port, "Socket disconnected");
    let _ = events.send(SocketEvent::Disconnect);
}

async fn establish<S>(options: &SocketOptions, stream: S) -> Result<Established<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match options.transport {
        Transport::Ws => ws::upgrade(options, stream).await,
        Transport::Http => Ok(http::adopt(options, stream)),
    }
}

/// Resolves on a disconnect request or when every handle is gone.
async fn wait_for_disconnect(commands: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Disconnect) | None => return,
            Some(Command::Send { .. }) => {}
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn deadline_after(period: Option<Duration>) -> Option<Instant> {
    period.map(|period| Instant::now() + period)
}

async fn drive<S>(
    mut stream: S,
    mut protocol: Box<dyn Protocol>,
    leftover: Vec<u8>,
    options: &SocketOptions,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::UnboundedSender<SocketEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let binary = options.codec.is_binary();
    let keepalive = options.keepalive.filter(|_| options.role == Role::Client);
    let mut next_ping = deadline_after(keepalive);
    let mut last_activity = Instant::now();
    let mut buffer = vec![0u8; READ_BUFFER_BYTES];

    if !leftover.is_empty() {
        let result = incoming(&mut stream, protocol.as_mut(), &leftover, events).await;
        match result {
            Ok(Flow::Continue { keepalive: pong }) => {
                if pong {
                    next_ping = deadline_after(keepalive);
                }
            }
            Ok(Flow::Stop) => {
                let _ = stream.shutdown().await;
                return;
            }
            Err(error) => {
                let _ = events.send(SocketEvent::Error(TransportError::Io(error)));
                return;
            }
        }
    }

    loop {
        let idle_deadline = options.idle_timeout.map(|idle| last_activity + idle);
        tokio::select! {
            read = stream.read(&mut buffer) => match read {
                Ok(0) => {
                    tracing::debug!(host = %options.host, port = options.port, "Peer closed the stream");
                    break;
                }
                Ok(n) => {
                    last_activity = Instant::now();
                    match incoming(&mut stream, protocol.as_mut(), &buffer[..n], events).await {
                        Ok(Flow::Continue { keepalive: pong }) => {
                            if pong {
                                next_ping = deadline_after(keepalive);
                            }
                        }
                        Ok(Flow::Stop) => break,
                        Err(error) => {
                            let _ = events.send(SocketEvent::Error(TransportError::Io(error)));
                            break;
                        }
                    }
                }
                Err(error) => {
                    let _ = events.send(SocketEvent::Error(TransportError::Io(error)));
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Send { payload, headers }) => {
                    let Some(frame) = protocol.send(&payload, &headers, binary) else {
                        tracing::debug!(len = payload.len(), "Payload could not be framed");
                        continue;
                    };
                    if let Err(error) = stream.write_all(&frame).await {
                        let _ = events.send(SocketEvent::Error(TransportError::Io(error)));
                        break;
                    }
                    metrics::record_frames("out", 1);
                }
                Some(Command::Disconnect) | None => {
                    if let Some(bytes) = protocol.close(CloseStatus::NORMAL) {
                        let _ = stream.write_all(&bytes).await;
                        metrics::record_close(CloseStatus::NORMAL);
                    }
                    break;
                }
            },
            _ = sleep_until(next_ping) => {
                next_ping = None;
                if let Some(ping) = protocol.keepalive() {
                    tracing::trace!(host = %options.host, "Sending keepalive ping");
                    if let Err(error) = stream.write_all(&ping).await {
                        let _ = events.send(SocketEvent::Error(TransportError::Io(error)));
                        break;
                    }
                }
            },
            _ = sleep_until(idle_deadline) => {
                tracing::info!(host = %options.host, port = options.port, "Idle timeout");
                let _ = events.send(SocketEvent::Error(TransportError::Timeout));
                if let Some(bytes) = protocol.close(CloseStatus::GOING_AWAY) {
                    let _ = stream.write_all(&bytes).await;
                    metrics::record_close(CloseStatus::GOING_AWAY);
                }
                break;
            },
        }
    }

    let _ = stream.shutdown().await;
}

enum Flow {
    Continue { keepalive: bool },
    Stop,
}

/// Feed bytes to the protocol and act on what it produced.
async fn incoming<S>(
    stream: &mut S,
    protocol: &mut dyn Protocol,
    bytes: &[u8],
    events: &mpsc::UnboundedSender<SocketEvent>,
) -> std::io::Result<Flow>
where
    S: AsyncWrite + Unpin,
{
    let received = protocol.receive(bytes);

    for reply in &received.replies {
        if let Err(error) = stream.write_all(reply).await {
            // the peer may already be gone when we echo its close
            if received.close.is_none() {
                return Err(error);
            }
        }
    }

    if !received.chunks.is_empty() {
        metrics::record_frames("in", received.chunks.len());
    }
    for chunk in received.chunks {
        let _ = events.send(SocketEvent::Receive {
            payload: chunk.payload,
            headers: chunk.headers,
        });
    }

    match received.close {
        None => Ok(Flow::Continue {
            keepalive: received.keepalive,
        }),
        Some(Closure::Peer(status)) => {
            tracing::debug!(status = %status, "Peer closed the connection");
            Ok(Flow::Stop)
        }
        Some(Closure::Violation(status)) => {
            metrics::record_close(status);
            let _ = events.send(SocketEvent::Error(TransportError::Protocol(status)));
            Ok(Flow::Stop)
        }
    }
}
