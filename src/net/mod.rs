//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → server.rs (remote-role tunnel per connection, shared registry)
//!     → connection.rs (tracked until the tunnel disconnects)
//!
//! Shutdown:
//!     stop accepting → disconnect tracked tunnels → slots released
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - A slot is held for as long as its tunnel stays connected
//! - Transport encryption is out of scope; terminate TLS in front

pub mod connection;
pub mod listener;
pub mod server;

pub use connection::{ConnectionId, ConnectionTracker};
pub use listener::{Listener, ListenerError};
pub use server::Server;
