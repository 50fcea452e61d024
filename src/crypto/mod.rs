//! Hash primitives.
//!
//! Only SHA-1 lives here, and only the WS handshake uses it to derive and
//! verify `Sec-WebSocket-Accept`.

pub mod sha1;

pub use sha1::Sha1;
