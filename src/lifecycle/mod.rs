//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → wait_for_signal resolves
//!
//! Shutdown (shutdown.rs):
//!     trigger() → every subscriber (accept loop, client session) stops
//!     → open tunnels are disconnected, unplugging their services
//! ```
//!
//! # Design Decisions
//! - Stop accepting first, then disconnect live tunnels
//! - A second signal is not special-cased; the process exits when main returns

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
