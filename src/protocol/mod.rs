//! Frame protocols: stateful stream parsers and encoders.
//!
//! # Data Flow
//! ```text
//! socket bytes in
//!     → Protocol::receive (buffers partial input across calls)
//!     → Received { chunks, replies, close, keepalive }
//!     → chunks go up to the tunnel, replies go straight back on the wire
//!
//! tunnel payload + headers
//!     → Protocol::send
//!     → frame bytes written to the socket
//! ```
//!
//! # Design Decisions
//! - Protocols never touch I/O; they only turn bytes into chunks and back
//! - Control traffic (close echoes, pongs, 4xx replies) is returned as
//!   `replies` so the socket driver stays protocol agnostic
//! - A chunk is only yielded once every byte of its frame has arrived

pub(crate) mod head;
pub mod http;
pub mod ws;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::HeaderMap;

pub use http::HttpProtocol;
pub use ws::WsProtocol;

/// Which end of a connection this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Originated the connection.
    Client,
    /// Accepted the connection.
    Remote,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Remote => write!(f, "remote"),
        }
    }
}

/// The unit a protocol yields and accepts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Chunk {
    pub payload: Vec<u8>,
    pub headers: HeaderMap,
}

/// WS close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseStatus(pub u16);

impl CloseStatus {
    pub const NORMAL: CloseStatus = CloseStatus(1000);
    pub const GOING_AWAY: CloseStatus = CloseStatus(1001);
    pub const PROTOCOL_ERROR: CloseStatus = CloseStatus(1002);
    pub const UNSUPPORTED_DATA: CloseStatus = CloseStatus(1003);
    pub const MESSAGE_TOO_BIG: CloseStatus = CloseStatus(1009);

    pub fn code(self) -> u16 {
        self.0
    }

    pub fn is_normal(self) -> bool {
        self == Self::NORMAL || self == Self::GOING_AWAY
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self.0 {
            1000 => "normal closure",
            1001 => "going away",
            1002 => "protocol error",
            1003 => "unsupported data",
            1009 => "message too big",
            _ => "unknown",
        };
        write!(f, "{} ({})", self.0, reason)
    }
}

/// Why the connection must now close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// The peer sent a close frame with this status.
    Peer(CloseStatus),
    /// This side detected a violation and answered with this status.
    Violation(CloseStatus),
}

/// Everything one `receive` call produced.
#[derive(Debug, Default)]
pub struct Received {
    /// Complete decoded chunks, in stream order.
    pub chunks: Vec<Chunk>,
    /// Bytes to write back immediately.
    pub replies: Vec<Vec<u8>>,
    /// Set once the connection has to be torn down.
    pub close: Option<Closure>,
    /// A keepalive pong arrived; schedule the next probe.
    pub keepalive: bool,
}

/// A framing over a byte stream.
pub trait Protocol: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Frame one payload. `None` once closed or when the payload cannot be framed.
    fn send(&mut self, payload: &[u8], headers: &HeaderMap, binary: bool) -> Option<Vec<u8>>;

    /// Feed raw bytes; returns every complete chunk and any control replies.
    fn receive(&mut self, bytes: &[u8]) -> Received;

    /// Closing bytes for `status`; `None` when already closed or the framing
    /// has no closing handshake.
    fn close(&mut self, status: CloseStatus) -> Option<Vec<u8>>;

    fn is_closed(&self) -> bool;

    /// A liveness probe, for framings that have one.
    fn keepalive(&mut self) -> Option<Vec<u8>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_status_display_names_known_codes() {
        assert_eq!(CloseStatus::MESSAGE_TOO_BIG.to_string(), "1009 (message too big)");
        assert_eq!(CloseStatus(4000).to_string(), "4000 (unknown)");
        assert!(CloseStatus::GOING_AWAY.is_normal());
        assert!(!CloseStatus::PROTOCOL_ERROR.is_normal());
    }
}
