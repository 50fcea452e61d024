//! Broadcast and multicast through a relay server.

use std::time::Duration;

use service_tunnel::config::Transport;
use service_tunnel::{Addressing, Role, Service, Value};

mod common;

use common::{client_tunnel, record, start_relay, test_config, wait_until};

#[tokio::test]
async fn broadcast_reaches_every_other_client_with_origin() {
    let config = test_config(Transport::Ws);
    let relay = start_relay(&config).await;

    let tunnels: Vec<_> = (0..3).map(|_| client_tunnel(&config, relay.addr)).collect();
    let services: Vec<_> = tunnels
        .iter()
        .map(|tunnel| Service::new("X", tunnel, Role::Client))
        .collect();
    let inboxes: Vec<_> = services.iter().map(|s| record(s, "broadcast")).collect();

    for (tunnel, service) in tunnels.iter().zip(&services) {
        tunnel.add_service(service);
        assert!(tunnel.connect(None));
    }
    wait_until(|| services.iter().all(Service::is_plugged)).await;
    wait_until(|| relay.registry.len("X") == 3).await;

    assert!(services[0].broadcast("hello", None));
    wait_until(|| inboxes[1].lock().unwrap().len() == 1 && inboxes[2].lock().unwrap().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(inboxes[0].lock().unwrap().is_empty());
    let first = inboxes[1].lock().unwrap()[0].clone();
    let second = inboxes[2].lock().unwrap()[0].clone();
    assert_eq!(first.value, Value::from("hello"));
    assert_eq!(second.value, Value::from("hello"));

    let origin = first.origin().expect("tagged with origin").to_string();
    assert!(origin.starts_with("127.0.0.1:"));
    assert_eq!(second.origin(), Some(origin.as_str()));

    for tunnel in &tunnels {
        tunnel.disconnect();
    }
    relay.shutdown.trigger();
    relay.task.await.unwrap();
}

#[tokio::test]
async fn broadcast_addressing_selects_event_or_method() {
    let config = test_config(Transport::Ws);
    let relay = start_relay(&config).await;

    let sender_tunnel = client_tunnel(&config, relay.addr);
    let receiver_tunnel = client_tunnel(&config, relay.addr);
    let sender = Service::new("room", &sender_tunnel, Role::Client);
    let receiver = Service::new("room", &receiver_tunnel, Role::Client);
    let said = record(&receiver, "said");
    let calls = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&calls);
    receiver.method("poke", move |_, message| sink.lock().unwrap().push(message.value.clone()));

    sender_tunnel.add_service(&sender);
    receiver_tunnel.add_service(&receiver);
    sender_tunnel.connect(None);
    receiver_tunnel.connect(None);
    wait_until(|| relay.registry.len("room") == 2 && sender.is_plugged() && receiver.is_plugged()).await;

    sender.broadcast(Value::Int(1), Some(Addressing::event("said")));
    sender.broadcast(Value::Int(2), Some(Addressing::method("poke")));
    wait_until(|| said.lock().unwrap().len() == 1 && calls.lock().unwrap().len() == 1).await;
    assert_eq!(said.lock().unwrap()[0].value, Value::Int(1));
    assert_eq!(calls.lock().unwrap()[0], Value::Int(2));

    relay.shutdown.trigger();
    relay.task.await.unwrap();
}

#[tokio::test]
async fn multicast_only_reaches_listed_origins() {
    let config = test_config(Transport::Ws);
    let relay = start_relay(&config).await;

    let tunnels: Vec<_> = (0..3).map(|_| client_tunnel(&config, relay.addr)).collect();
    let services: Vec<_> = tunnels
        .iter()
        .map(|tunnel| Service::new("X", tunnel, Role::Client))
        .collect();
    let hellos = record(&services[0], "hello");
    let multicasts: Vec<_> = services.iter().map(|s| record(s, "multicast")).collect();

    for (tunnel, service) in tunnels.iter().zip(&services) {
        tunnel.add_service(service);
        tunnel.connect(None);
    }
    wait_until(|| relay.registry.len("X") == 3 && services.iter().all(Service::is_plugged)).await;

    // learn how the relay sees client 1
    services[1].broadcast("hi", Some(Addressing::event("hello")));
    wait_until(|| hellos.lock().unwrap().len() == 1).await;
    let target = hellos.lock().unwrap()[0].origin().expect("origin").to_string();

    services[0].set_multicast([target.clone()]);
    assert!(services[0].multicast("secret", None));
    wait_until(|| multicasts[1].lock().unwrap().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(multicasts[0].lock().unwrap().is_empty());
    assert!(multicasts[2].lock().unwrap().is_empty());
    assert_eq!(multicasts[1].lock().unwrap()[0].value, Value::from("secret"));

    relay.shutdown.trigger();
    relay.task.await.unwrap();
}
