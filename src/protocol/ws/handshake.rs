//! WS upgrade handshake.
//!
//! # Data Flow
//! ```text
//! client                                   remote
//!   generate_key → client_request  ──────▶ verify_request → accept_key
//!   verify_response(key)           ◀────── server_response
//! ```
//!
//! Both sides insist on the same fixed subprotocol token. A failed check
//! closes the raw connection before any frame is exchanged.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use thiserror::Error;

use crate::crypto::Sha1;
use crate::protocol::head;

/// Appended to the client key before hashing.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only subprotocol either side accepts.
pub const SUBPROTOCOL: &str = "service-tunnel";

pub const VERSION: &str = "13";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("malformed handshake head")]
    Malformed,
    #[error("handshake head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("not a websocket upgrade")]
    NotUpgrade,
    #[error("missing Sec-WebSocket-Key")]
    MissingKey,
    #[error("unexpected status line: {0}")]
    Status(String),
    #[error("subprotocol mismatch: {0:?}")]
    Subprotocol(Option<String>),
    #[error("Sec-WebSocket-Accept mismatch")]
    AcceptMismatch,
    #[error("connection closed during handshake")]
    Closed,
}

/// A random 16-byte nonce, base64 encoded.
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    STANDARD.encode(nonce)
}

/// `base64(SHA1(key + GUID))`
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(GUID.as_bytes());
    STANDARD.encode(sha.digest())
}

pub fn client_request(host: &str, port: u16, origin: &str, key: &str) -> String {
    head::render(
        "GET / HTTP/1.1",
        &[
            ("Host".to_string(), format!("{}:{}", host, port)),
            ("Upgrade".to_string(), "WebSocket".to_string()),
            ("Connection".to_string(), "Upgrade".to_string()),
            ("Origin".to_string(), origin.to_string()),
            ("Sec-WebSocket-Key".to_string(), key.to_string()),
            ("Sec-WebSocket-Version".to_string(), VERSION.to_string()),
            ("Sec-WebSocket-Protocol".to_string(), SUBPROTOCOL.to_string()),
        ],
    )
}

pub fn server_response(origin: &str, accept: &str) -> String {
    head::render(
        "HTTP/1.1 101 WebSocket Protocol Handshake",
        &[
            ("Upgrade".to_string(), "WebSocket".to_string()),
            ("Connection".to_string(), "Upgrade".to_string()),
            ("Sec-WebSocket-Version".to_string(), VERSION.to_string()),
            ("Sec-WebSocket-Origin".to_string(), origin.to_string()),
            ("Sec-WebSocket-Protocol".to_string(), SUBPROTOCOL.to_string()),
            ("Sec-WebSocket-Accept".to_string(), accept.to_string()),
        ],
    )
}

fn check_subprotocol(value: Option<&str>) -> Result<(), HandshakeError> {
    let offered = value.map(|v| v.split(',').any(|token| token.trim() == SUBPROTOCOL));
    match offered {
        Some(true) => Ok(()),
        _ => Err(HandshakeError::Subprotocol(value.map(String::from))),
    }
}

/// Validate an upgrade request head; returns the client key.
pub fn verify_request(bytes: &[u8]) -> Result<String, HandshakeError> {
    let head = head::parse(bytes).ok_or(HandshakeError::Malformed)?;
    let (method, _, _) = head.start_parts().ok_or(HandshakeError::Malformed)?;
    if method != "GET" {
        return Err(HandshakeError::NotUpgrade);
    }
    let upgrade = head.get("upgrade").unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::NotUpgrade);
    }
    let key = head
        .get("sec-websocket-key")
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingKey)?;
    check_subprotocol(head.get("sec-websocket-protocol"))?;
    Ok(key.to_string())
}

/// Validate the upgrade response against the key this side sent.
pub fn verify_response(bytes: &[u8], key: &str) -> Result<(), HandshakeError> {
    let head = head::parse(bytes).ok_or(HandshakeError::Malformed)?;
    let (_, status, _) = head.start_parts().ok_or(HandshakeError::Malformed)?;
    if status != "101" {
        return Err(HandshakeError::Status(head.start_line.clone()));
    }
    let upgrade = head.get("upgrade").unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::NotUpgrade);
    }
    check_subprotocol(head.get("sec-websocket-protocol"))?;
    match head.get("sec-websocket-accept") {
        Some(accept) if accept == accept_key(key) => Ok(()),
        _ => Err(HandshakeError::AcceptMismatch),
    }
}
