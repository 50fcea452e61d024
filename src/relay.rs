//! Turns a remote-role tunnel into a broadcast hub.
//!
//! When the peer plugs an id the server does not host, a remote-role
//! service with that id is created and added. Adding it acknowledges the
//! plug, and the built-in broadcast/multicast handlers then fan traffic out
//! through the shared [`BroadcastRegistry`](crate::service::BroadcastRegistry).

use crate::events::ListenerId;
use crate::protocol::Role;
use crate::service::Service;
use crate::tunnel::Tunnel;

/// Host any service id the peer asks for.
pub fn serve_relay(tunnel: &Tunnel) -> ListenerId {
    let weak = tunnel.downgrade();
    tunnel.events().plug_requested.bind(move |id: &String| {
        let Some(tunnel) = weak.upgrade() else {
            return;
        };
        if tunnel.service(id).is_some() {
            return;
        }
        let service = Service::new(id.as_str(), &tunnel, Role::Remote);
        if tunnel.add_service(&service) {
            tracing::debug!(service = %id, origin = %tunnel.origin(), "Relay hosting service");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn relay_acknowledges_unknown_plugs() {
        let mut config = TunnelConfig::default();
        config.reconnect.delay_ms = 0;
        let client = Tunnel::new(config.clone(), Role::Client);
        let remote = Tunnel::new(config, Role::Remote);
        serve_relay(&remote);

        let (a, b) = tokio::io::duplex(64 * 1024);
        client.connect_with(a);
        remote.connect_with(b);

        let service = Service::new("room", &client, Role::Client);
        client.add_service(&service);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !service.is_plugged() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("plugged through the relay");

        let hosted = remote.service("room").expect("relay created the service");
        assert!(hosted.is_plugged());
        assert!(remote.broadcast_registry().contains(&hosted));
    }
}
