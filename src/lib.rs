//! Service tunnel: typed, named service messages over one streaming connection.

// Wire layers
pub mod codec;
pub mod crypto;
pub mod protocol;
pub mod socket;

// Multiplexing
pub mod events;
pub mod relay;
pub mod service;
pub mod tunnel;

// Serving and cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;

pub use codec::{Codec, CodecKind, HeaderMap, TagRegistry, Value};
pub use config::Config;
pub use lifecycle::Shutdown;
pub use net::Server;
pub use protocol::Role;
pub use service::{Addressing, BroadcastRegistry, Service};
pub use tunnel::{Message, Tunnel, TunnelState};
