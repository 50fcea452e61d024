//! Accept loop that turns connections into remote-role tunnels.
//!
//! # Responsibilities
//! - Build one remote-role tunnel per accepted connection
//! - Share one broadcast registry across all of them
//! - Stop accepting on shutdown and disconnect live tunnels

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::codec::TagRegistry;
use crate::config::{Config, TunnelConfig};
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};
use crate::protocol::Role;
use crate::service::BroadcastRegistry;
use crate::tunnel::Tunnel;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay server: a listener plus the state its tunnels share.
pub struct Server {
    listener: Listener,
    tunnel: TunnelConfig,
    registry: BroadcastRegistry,
    tags: Arc<TagRegistry>,
    connections: ConnectionTracker,
}

impl Server {
    pub async fn bind(config: &Config) -> Result<Self, ListenerError> {
        let listener = Listener::bind(&config.server).await?;
        Ok(Self {
            listener,
            tunnel: config.tunnel.clone(),
            registry: BroadcastRegistry::new(),
            tags: Arc::new(TagRegistry::default()),
            connections: ConnectionTracker::new(),
        })
    }

    /// Use a custom tag registry for every tunnel's codec.
    pub fn with_tag_registry(mut self, tags: Arc<TagRegistry>) -> Self {
        self.tags = tags;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &BroadcastRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    /// Per-connection tunnel settings: the peer is the origin.
    fn tunnel_config(&self, peer: SocketAddr) -> TunnelConfig {
        let mut config = self.tunnel.clone();
        config.host = peer.ip().to_string();
        config.port = peer.port();
        config
    }

    /// Accept until shutdown. `on_connect` sees each tunnel before it connects.
    pub async fn run<F>(&self, on_connect: F, mut shutdown: broadcast::Receiver<()>) -> Result<(), ListenerError>
    where
        F: Fn(&Tunnel),
    {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.recv() => {
                    tracing::info!(active = self.connections.active_count(), "Server shutting down");
                    break;
                }
            };

            let (stream, peer, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Accept(error)) => {
                    tracing::warn!(error = %error, "Accept failed");
                    continue;
                }
                Err(error) => return Err(error),
            };

            let tunnel = Tunnel::builder(self.tunnel_config(peer))
                .role(Role::Remote)
                .broadcast_registry(self.registry.clone())
                .tag_registry(Arc::clone(&self.tags))
                .build();
            let id = self.connections.track(&tunnel, Some(permit));
            tracing::debug!(connection_id = %id, peer = %peer, "Tunnel accepted");

            on_connect(&tunnel);
            tunnel.connect(Some(stream));
        }

        let stopped = self.connections.disconnect_all();
        if !self.connections.wait_for_drain(DRAIN_TIMEOUT).await {
            tracing::warn!(remaining = self.connections.active_count(), "Tunnels still open after drain timeout");
        }
        tracing::info!(stopped, "Server stopped");
        Ok(())
    }
}
