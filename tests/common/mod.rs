//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use service_tunnel::config::{Config, Transport};
use service_tunnel::{relay, BroadcastRegistry, Message, Role, Server, Service, Shutdown, Tunnel};
use tokio::task::JoinHandle;

pub struct RelayHandle {
    pub addr: SocketAddr,
    pub registry: BroadcastRegistry,
    pub shutdown: Shutdown,
    pub task: JoinHandle<()>,
}

pub fn test_config(transport: Transport) -> Config {
    let mut config = Config::default();
    config.server.bind_address = "127.0.0.1:0".to_string();
    config.tunnel.transport = transport;
    config.tunnel.reconnect.delay_ms = 0;
    config
}

/// Start a relay server on an ephemeral port.
pub async fn start_relay(config: &Config) -> RelayHandle {
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry().clone();
    let shutdown = Shutdown::new();
    let stop = shutdown.subscribe();

    let task = tokio::spawn(async move {
        server
            .run(
                |tunnel| {
                    relay::serve_relay(tunnel);
                },
                stop,
            )
            .await
            .unwrap();
    });

    RelayHandle {
        addr,
        registry,
        shutdown,
        task,
    }
}

/// A client tunnel pointed at `addr`, not yet connected.
pub fn client_tunnel(config: &Config, addr: SocketAddr) -> Tunnel {
    let mut tunnel = config.tunnel.clone();
    tunnel.host = addr.ip().to_string();
    tunnel.port = addr.port();
    Tunnel::new(tunnel, Role::Client)
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

/// Record every message delivered to `event` on `service`.
pub fn record(service: &Service, event: &str) -> Arc<Mutex<Vec<Message>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    service.on(event, move |message| sink.lock().unwrap().push(message.clone()));
    seen
}
