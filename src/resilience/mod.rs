//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Client tunnel loses its transport (error or unrequested disconnect):
//!     → failure counter incremented
//!     → backoff.rs (delay = base · 2^(failures-1), capped, plus jitter)
//!     → reconnect scheduled after the delay
//!     → counter reset on the next successful connect
//! ```
//!
//! # Design Decisions
//! - One policy for errors and plain disconnects
//! - A user-requested disconnect never reconnects

pub mod backoff;

pub use backoff::calculate_backoff;
