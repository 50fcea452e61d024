//! Named endpoints multiplexed over one tunnel.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     emit / call / accept / reject → Tunnel::send (id + event|method)
//!     broadcast / multicast (client) → Tunnel::send (method "broadcast"|"multicast")
//!     broadcast / multicast (remote) → BroadcastRegistry members with the same id
//!                                      → each member's tunnel, tagged @service-origin
//!
//! Inbound (routed by the tunnel):
//!     @service-method → method handler (or built-in fan-out on the remote role)
//!     @service-event  → event listeners
//! ```
//!
//! # Design Decisions
//! - A service holds its tunnel weakly; the tunnel holds plugged services
//! - Broadcast addressing travels in `@broadcast-event` / `@broadcast-method`
//!   headers, multicast targets in `@multicast` (a list of origins)
//! - There is no request/response correlation: concurrent calls to the same
//!   method cannot be told apart

pub mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::codec::{HeaderMap, Value};
use crate::events::{Emitter, EventMap, ListenerId};
use crate::protocol::Role;
use crate::tunnel::{Message, Tunnel, WeakTunnel, SERVICE_ORIGIN};

pub use registry::BroadcastRegistry;

pub const BROADCAST: &str = "broadcast";
pub const MULTICAST: &str = "multicast";
const BROADCAST_EVENT: &str = "@broadcast-event";
const BROADCAST_METHOD: &str = "@broadcast-method";
const MULTICAST_TARGETS: &str = "@multicast";

/// Handler for a named method call.
pub type MethodHandler = Arc<dyn Fn(&Service, &Message) + Send + Sync>;

/// Where fan-out copies are delivered on the receiving services.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Addressing {
    pub event: Option<String>,
    pub method: Option<String>,
}

impl Addressing {
    pub fn event(name: impl Into<String>) -> Self {
        Self {
            event: Some(name.into()),
            method: None,
        }
    }

    pub fn method(name: impl Into<String>) -> Self {
        Self {
            event: None,
            method: Some(name.into()),
        }
    }

    fn from_headers(headers: &HeaderMap) -> Self {
        let read = |key: &str| headers.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            event: read(BROADCAST_EVENT),
            method: read(BROADCAST_METHOD),
        }
    }

    fn write_headers(&self, headers: &mut HeaderMap) {
        if let Some(event) = &self.event {
            headers.insert(BROADCAST_EVENT.to_string(), Value::from(event.as_str()));
        }
        if let Some(method) = &self.method {
            headers.insert(BROADCAST_METHOD.to_string(), Value::from(method.as_str()));
        }
    }

    /// Headers for one delivered copy. A method wins over an event.
    fn delivery(&self, id: &str, default_event: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("id".to_string(), Value::from(id));
        match (&self.method, &self.event) {
            (Some(method), _) => headers.insert("method".to_string(), Value::from(method.as_str())),
            (None, Some(event)) => headers.insert("event".to_string(), Value::from(event.as_str())),
            (None, None) => headers.insert("event".to_string(), Value::from(default_event)),
        };
        headers
    }
}

/// A named endpoint bound to one tunnel for its whole life.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    id: String,
    role: Role,
    tunnel: WeakTunnel,
    origin: String,
    registry: BroadcastRegistry,
    events: EventMap<Message>,
    methods: Mutex<HashMap<String, MethodHandler>>,
    plug: Emitter<()>,
    unplug: Emitter<()>,
    plugged: AtomicBool,
    multicast: Mutex<Vec<String>>,
}

impl Service {
    pub fn new(id: impl Into<String>, tunnel: &Tunnel, role: Role) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                id: id.into(),
                role,
                tunnel: tunnel.downgrade(),
                origin: tunnel.origin(),
                registry: tunnel.broadcast_registry().clone(),
                events: EventMap::new(),
                methods: Mutex::new(HashMap::new()),
                plug: Emitter::new(),
                unplug: Emitter::new(),
                plugged: AtomicBool::new(false),
                multicast: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// `host:port` of the owning tunnel; the peer address on a server.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// The owning tunnel, if it is still alive.
    pub fn tunnel(&self) -> Option<Tunnel> {
        self.inner.tunnel.upgrade()
    }

    pub fn is_plugged(&self) -> bool {
        self.inner.plugged.load(Ordering::SeqCst)
    }

    pub fn ptr_eq(&self, other: &Service) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn belongs_to(&self, tunnel: &Tunnel) -> bool {
        self.inner.tunnel.points_to(tunnel)
    }

    /// Add to the tunnel; the service becomes active once the peer answers.
    pub fn plug(&self) -> bool {
        self.tunnel().is_some_and(|tunnel| tunnel.add_service(self))
    }

    /// Ask the peer to unplug; the service stays until it answers.
    pub fn unplug(&self) -> bool {
        self.tunnel().is_some_and(|tunnel| tunnel.remove_service(self))
    }

    pub fn on<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.events.bind(event, callback)
    }

    pub fn once<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.events.once(event, callback)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.events.unbind(event, id)
    }

    pub fn on_plug<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.inner.plug.bind(callback)
    }

    pub fn on_unplug<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.inner.unplug.bind(callback)
    }

    /// Register the handler for incoming calls of `name`, replacing any previous one.
    pub fn method<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Service, &Message) + Send + Sync + 'static,
    {
        self.inner
            .methods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(handler));
    }

    fn handler(&self, name: &str) -> Option<MethodHandler> {
        self.inner
            .methods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn send(&self, value: Value, headers: HeaderMap) -> bool {
        self.tunnel().is_some_and(|tunnel| tunnel.send(value, headers))
    }

    fn addressed(&self, key: &str, name: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("id".to_string(), Value::from(self.id()));
        headers.insert(key.to_string(), Value::from(name));
        headers
    }

    /// Trigger `event` on the peer's service with this id.
    pub fn emit(&self, event: &str, value: impl Into<Value>) -> bool {
        self.send(value.into(), self.addressed("event", event))
    }

    /// Invoke `method` on the peer's service with this id.
    pub fn call(&self, method: &str, value: impl Into<Value>) -> bool {
        self.send(value.into(), self.addressed("method", method))
    }

    pub fn accept(&self, message: impl Into<Value>, blob: Option<Value>) -> bool {
        self.emit("success", outcome(message.into(), blob))
    }

    pub fn reject(&self, message: impl Into<Value>, blob: Option<Value>) -> bool {
        self.emit("error", outcome(message.into(), blob))
    }

    /// Restrict `multicast` to services whose origin is listed.
    pub fn set_multicast<I, S>(&self, origins: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.inner.multicast.lock().unwrap_or_else(PoisonError::into_inner) =
            origins.into_iter().map(Into::into).collect();
    }

    pub fn multicast_targets(&self) -> Vec<String> {
        self.inner
            .multicast
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver `value` to every other service sharing this id.
    pub fn broadcast(&self, value: impl Into<Value>, addressing: Option<Addressing>) -> bool {
        let addressing = addressing.unwrap_or_default();
        match self.inner.role {
            Role::Client => {
                let mut headers = self.addressed("method", BROADCAST);
                addressing.write_headers(&mut headers);
                self.send(value.into(), headers)
            }
            Role::Remote => self.fan_out(&value.into(), &addressing, BROADCAST, None) > 0,
        }
    }

    /// Like `broadcast`, restricted to the origins set with `set_multicast`.
    pub fn multicast(&self, value: impl Into<Value>, addressing: Option<Addressing>) -> bool {
        let addressing = addressing.unwrap_or_default();
        let targets = self.multicast_targets();
        match self.inner.role {
            Role::Client => {
                let mut headers = self.addressed("method", MULTICAST);
                addressing.write_headers(&mut headers);
                let origins = targets.into_iter().map(Value::from).collect::<Vec<_>>();
                headers.insert(MULTICAST_TARGETS.to_string(), Value::Array(origins));
                self.send(value.into(), headers)
            }
            Role::Remote => self.fan_out(&value.into(), &addressing, MULTICAST, Some(&targets)) > 0,
        }
    }

    /// Resend to registry members with this id, skipping the sender.
    fn fan_out(
        &self,
        value: &Value,
        addressing: &Addressing,
        default_event: &str,
        targets: Option<&[String]>,
    ) -> usize {
        let mut delivered = 0;
        for member in self.inner.registry.members(self.id()) {
            if member.ptr_eq(self) {
                continue;
            }
            if let Some(targets) = targets {
                if !targets.iter().any(|origin| origin == member.origin()) {
                    continue;
                }
            }
            let mut headers = addressing.delivery(self.id(), default_event);
            headers.insert(SERVICE_ORIGIN.to_string(), Value::from(self.origin()));
            if member.send(value.clone(), headers) {
                delivered += 1;
            }
        }
        tracing::debug!(
            service = %self.id(),
            origin = %self.origin(),
            kind = default_event,
            delivered,
            "Fan-out complete"
        );
        delivered
    }

    pub(crate) fn mark_plugged(&self) {
        if self.inner.plugged.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.role == Role::Remote {
            self.inner.registry.add(self);
        }
        tracing::info!(service = %self.id(), origin = %self.origin(), "Service plugged");
        crate::observability::metrics::record_plug();
        self.inner.plug.trigger(&());
    }

    /// Always fires `unplug`, even for a service that never finished plugging.
    pub(crate) fn mark_unplugged(&self) {
        self.inner.plugged.store(false, Ordering::SeqCst);
        self.inner.registry.remove(self);
        tracing::info!(service = %self.id(), origin = %self.origin(), "Service unplugged");
        self.inner.unplug.trigger(&());
    }

    /// Route a message addressed to this service. `false` when nothing handled it.
    pub(crate) fn dispatch(&self, message: &Message) -> bool {
        if let Some(method) = message.method() {
            if let Some(handler) = self.handler(method) {
                handler(self, message);
                return true;
            }
            return self.builtin(method, message);
        }
        match message.event() {
            Some(event) => self.inner.events.trigger(event, message) > 0,
            None => false,
        }
    }

    fn builtin(&self, method: &str, message: &Message) -> bool {
        if self.inner.role != Role::Remote {
            return false;
        }
        let addressing = Addressing::from_headers(&message.headers);
        match method {
            BROADCAST => {
                self.fan_out(&message.value, &addressing, BROADCAST, None);
                true
            }
            MULTICAST => {
                let targets = match message.headers.get(MULTICAST_TARGETS) {
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                    _ => self.multicast_targets(),
                };
                self.fan_out(&message.value, &addressing, MULTICAST, Some(&targets));
                true
            }
            _ => false,
        }
    }
}

fn outcome(message: Value, blob: Option<Value>) -> Value {
    let mut map = std::collections::BTreeMap::new();
    map.insert("message".to_string(), message);
    map.insert("blob".to_string(), blob.unwrap_or(Value::Null));
    Value::Map(map)
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("origin", &self.inner.origin)
            .field("plugged", &self.is_plugged())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use std::sync::atomic::AtomicUsize;

    fn remote_tunnel(registry: &BroadcastRegistry, port: u16) -> Tunnel {
        let mut config = TunnelConfig::default();
        config.port = port;
        Tunnel::builder(config)
            .role(Role::Remote)
            .broadcast_registry(registry.clone())
            .build()
    }

    fn message(headers: &[(&str, Value)], value: Value) -> Message {
        Message {
            value,
            headers: headers
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        }
    }

    #[test]
    fn addressing_prefers_method() {
        let both = Addressing {
            event: Some("e".to_string()),
            method: Some("m".to_string()),
        };
        let headers = both.delivery("svc", BROADCAST);
        assert_eq!(headers.get("method"), Some(&Value::from("m")));
        assert!(headers.get("event").is_none());

        let default = Addressing::default().delivery("svc", MULTICAST);
        assert_eq!(default.get("event"), Some(&Value::from("multicast")));
        assert_eq!(default.get("id"), Some(&Value::from("svc")));
    }

    #[test]
    fn addressing_survives_headers() {
        let mut headers = HeaderMap::new();
        Addressing::method("said").write_headers(&mut headers);
        assert_eq!(Addressing::from_headers(&headers), Addressing::method("said"));
    }

    #[test]
    fn outcome_carries_message_and_blob() {
        let value = outcome(Value::from("ok"), None);
        assert_eq!(value.get("message"), Some(&Value::from("ok")));
        assert_eq!(value.get("blob"), Some(&Value::Null));
    }

    #[test]
    fn dispatch_prefers_method_handlers() {
        let registry = BroadcastRegistry::new();
        let tunnel = remote_tunnel(&registry, 7400);
        let service = Service::new("svc", &tunnel, Role::Remote);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        service.method("ping", move |_, message| {
            assert_eq!(message.value, Value::Int(1));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let ping = message(&[("@service-method", Value::from("ping"))], Value::Int(1));
        assert!(service.dispatch(&ping));
        let unknown = message(&[("@service-method", Value::from("nope"))], Value::Null);
        assert!(!service.dispatch(&unknown));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_events_report_whether_anyone_listened() {
        let registry = BroadcastRegistry::new();
        let tunnel = remote_tunnel(&registry, 7400);
        let service = Service::new("svc", &tunnel, Role::Client);
        let said = message(&[("@service-event", Value::from("said"))], Value::Null);
        assert!(!service.dispatch(&said));

        let id = service.once("said", |_| {});
        assert!(service.dispatch(&said));
        assert!(!service.off("said", id));
    }

    #[test]
    fn plug_registers_remote_services_once() {
        let registry = BroadcastRegistry::new();
        let tunnel = remote_tunnel(&registry, 7400);
        let service = Service::new("svc", &tunnel, Role::Remote);
        let plugs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&plugs);
        service.on_plug(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        service.mark_plugged();
        service.mark_plugged();
        assert!(service.is_plugged());
        assert!(registry.contains(&service));
        assert_eq!(plugs.load(Ordering::SeqCst), 1);

        service.mark_unplugged();
        assert!(!service.is_plugged());
        assert!(!registry.contains(&service));
    }

    #[test]
    fn client_services_stay_out_of_the_registry() {
        let registry = BroadcastRegistry::new();
        let tunnel = remote_tunnel(&registry, 7400);
        let service = Service::new("svc", &tunnel, Role::Client);
        service.mark_plugged();
        assert!(!registry.contains(&service));
    }

    #[test]
    fn unconnected_services_cannot_send() {
        let registry = BroadcastRegistry::new();
        let tunnel = remote_tunnel(&registry, 7400);
        let service = Service::new("svc", &tunnel, Role::Client);
        assert!(!service.emit("said", "hi"));
        assert!(!service.broadcast("hi", None));
        assert!(!service.accept("ok", None));
    }

    #[test]
    fn set_multicast_replaces_targets() {
        let registry = BroadcastRegistry::new();
        let tunnel = remote_tunnel(&registry, 7400);
        let service = Service::new("svc", &tunnel, Role::Remote);
        service.set_multicast(["a:1", "b:2"]);
        service.set_multicast(vec!["c:3".to_string()]);
        assert_eq!(service.multicast_targets(), vec!["c:3".to_string()]);
    }
}
