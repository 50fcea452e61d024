//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Keep every live server tunnel reachable for shutdown
//! - Release the connection slot when the tunnel disconnects

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;

use crate::net::listener::ConnectionPermit;
use crate::tunnel::Tunnel;

/// Relaxed ordering is enough; only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Live server tunnels, keyed by connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    tunnels: Arc<DashMap<ConnectionId, Tunnel>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `tunnel` until its next `disconnect` event.
    ///
    /// Call before connecting so an immediate disconnect is not missed.
    pub fn track(&self, tunnel: &Tunnel, permit: Option<ConnectionPermit>) -> ConnectionId {
        let guard = ConnectionGuard {
            tunnels: Arc::clone(&self.tunnels),
            id: ConnectionId::new(),
            _permit: permit,
        };
        let id = guard.id;
        self.tunnels.insert(id, tunnel.clone());

        let slot = Mutex::new(Some(guard));
        tunnel.events().disconnect.once(move |_| {
            slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        });
        id
    }

    pub fn active_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Disconnect every tracked tunnel. Returns how many were asked to stop.
    pub fn disconnect_all(&self) -> usize {
        let tunnels: Vec<Tunnel> = self.tunnels.iter().map(|entry| entry.value().clone()).collect();
        tunnels.iter().filter(|tunnel| tunnel.disconnect()).count()
    }

    /// Wait until nothing is tracked, up to `deadline`. `true` when drained.
    pub async fn wait_for_drain(&self, deadline: Duration) -> bool {
        tokio::time::timeout(deadline, async {
            while !self.tunnels.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok()
    }
}

/// Holds a connection's slot; untracks it on drop.
#[derive(Debug)]
struct ConnectionGuard {
    tunnels: Arc<DashMap<ConnectionId, Tunnel>>,
    id: ConnectionId,
    _permit: Option<ConnectionPermit>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tunnels.remove(&self.id);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
