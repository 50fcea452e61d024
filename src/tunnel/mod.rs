//! The duplex service multiplexer.
//!
//! # Responsibilities
//! - Own one socket and translate its events into tunnel events
//! - Map application headers (`id`, `event`, `method`) to wire headers
//! - Run the plug/unplug handshake and route service traffic
//! - Reconnect client tunnels with backoff after unrequested disconnects
//!
//! # Data Flow
//! ```text
//! connect(existing?)
//!     → Socket::connect → SocketEvents
//!     → pump task:  Connect    → state Connected, @plug for waiting services
//!                   Receive    → codec decode → route()
//!                   Error      → `error` event
//!                   Disconnect → unplug everything → `disconnect` → maybe reconnect
//!
//! route(message):
//!     @service-method = @plug   → waiting → active (once), else remember request
//!     @service-method = @unplug → remove, echo when the peer started it
//!     known @service-id         → Service::dispatch
//!     anything else             → generic `receive`
//! ```
//!
//! # Design Decisions
//! - Each connect bumps a generation; events from older sockets are dropped
//! - No lock is held while listeners run
//! - Listeners that need the tunnel should capture a [`WeakTunnel`]

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::codec::{Codec, HeaderMap, TagRegistry, Value};
use crate::config::TunnelConfig;
use crate::events::Emitter;
use crate::observability::metrics;
use crate::protocol::Role;
use crate::resilience::calculate_backoff;
use crate::service::{BroadcastRegistry, Service};
use crate::socket::{Socket, SocketEvent, SocketEvents, SocketOptions, TransportError};

pub const SERVICE_ID: &str = "@service-id";
pub const SERVICE_EVENT: &str = "@service-event";
pub const SERVICE_METHOD: &str = "@service-method";
pub const SERVICE_ORIGIN: &str = "@service-origin";
pub const PLUG: &str = "@plug";
pub const UNPLUG: &str = "@unplug";

/// Application header → wire header.
const RESERVED_HEADERS: [(&str, &str); 3] = [
    ("id", SERVICE_ID),
    ("event", SERVICE_EVENT),
    ("method", SERVICE_METHOD),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
}

/// A decoded payload and the headers it arrived with.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub value: Value,
    pub headers: HeaderMap,
}

impl Message {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    pub fn service_id(&self) -> Option<&str> {
        self.header(SERVICE_ID)
    }

    pub fn event(&self) -> Option<&str> {
        self.header(SERVICE_EVENT)
    }

    pub fn method(&self) -> Option<&str> {
        self.header(SERVICE_METHOD)
    }

    /// Sender's `host:port` on broadcast and multicast copies.
    pub fn origin(&self) -> Option<&str> {
        self.header(SERVICE_ORIGIN)
    }
}

/// Observers of a tunnel.
#[derive(Debug, Default)]
pub struct TunnelEvents {
    pub connect: Emitter<()>,
    /// Traffic not addressed to a local service.
    pub receive: Emitter<Message>,
    pub error: Emitter<TransportError>,
    pub disconnect: Emitter<()>,
    /// The peer plugged an id with no local service yet.
    pub plug_requested: Emitter<String>,
}

/// Cheap handle to a tunnel; clones share state.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

/// Non-owning tunnel handle for listeners and services.
#[derive(Clone, Default)]
pub struct WeakTunnel {
    inner: Weak<Inner>,
}

struct Inner {
    config: TunnelConfig,
    role: Role,
    codec: Arc<dyn Codec>,
    registry: BroadcastRegistry,
    events: TunnelEvents,
    state: Mutex<State>,
}

struct State {
    status: TunnelState,
    socket: Option<Socket>,
    generation: u64,
    waiting: Vec<Service>,
    active: Vec<Service>,
    /// Ids we sent `@unplug` for and still await the echo.
    unplugging: HashSet<String>,
    /// Ids the peer plugged before a local service existed.
    requested: HashSet<String>,
    /// Whether the current socket dialed out (only those reconnect).
    dialed: bool,
    user_disconnect: bool,
    failures: u32,
}

impl State {
    fn new() -> Self {
        Self {
            status: TunnelState::Disconnected,
            socket: None,
            generation: 0,
            waiting: Vec::new(),
            active: Vec::new(),
            unplugging: HashSet::new(),
            requested: HashSet::new(),
            dialed: false,
            user_disconnect: false,
            failures: 0,
        }
    }

    fn find(&self, id: &str) -> Option<&Service> {
        self.active
            .iter()
            .chain(self.waiting.iter())
            .find(|service| service.id() == id)
    }

    fn take(&mut self, id: &str) -> Option<Service> {
        if let Some(index) = self.active.iter().position(|s| s.id() == id) {
            return Some(self.active.remove(index));
        }
        self.waiting
            .iter()
            .position(|s| s.id() == id)
            .map(|index| self.waiting.remove(index))
    }

    /// Empty both lists, active services first.
    fn drain(&mut self) -> Vec<Service> {
        self.unplugging.clear();
        self.requested.clear();
        let mut services = std::mem::take(&mut self.active);
        services.append(&mut self.waiting);
        services
    }
}

/// Builds a [`Tunnel`] from configuration.
pub struct TunnelBuilder {
    config: TunnelConfig,
    role: Role,
    registry: Option<BroadcastRegistry>,
    tags: Option<Arc<TagRegistry>>,
}

impl TunnelBuilder {
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Share plugged remote services with other tunnels.
    pub fn broadcast_registry(mut self, registry: BroadcastRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn tag_registry(mut self, tags: Arc<TagRegistry>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn build(self) -> Tunnel {
        let tags = self.tags.unwrap_or_default();
        Tunnel {
            inner: Arc::new(Inner {
                codec: self.config.codec.build(tags),
                config: self.config,
                role: self.role,
                registry: self.registry.unwrap_or_default(),
                events: TunnelEvents::default(),
                state: Mutex::new(State::new()),
            }),
        }
    }
}

impl Tunnel {
    pub fn builder(config: TunnelConfig) -> TunnelBuilder {
        TunnelBuilder {
            config,
            role: Role::Client,
            registry: None,
            tags: None,
        }
    }

    pub fn new(config: TunnelConfig, role: Role) -> Self {
        Self::builder(config).role(role).build()
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.inner.codec
    }

    pub fn events(&self) -> &TunnelEvents {
        &self.inner.events
    }

    pub fn broadcast_registry(&self) -> &BroadcastRegistry {
        &self.inner.registry
    }

    /// `host:port` this tunnel talks to.
    pub fn origin(&self) -> String {
        format!("{}:{}", self.inner.config.host, self.inner.config.port)
    }

    pub fn downgrade(&self) -> WeakTunnel {
        WeakTunnel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Tunnel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> TunnelState {
        self.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TunnelState::Connected
    }

    /// Ids awaiting the peer's plug acknowledgment.
    pub fn waiting_ids(&self) -> Vec<String> {
        self.lock().waiting.iter().map(|s| s.id().to_string()).collect()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.lock().active.iter().map(|s| s.id().to_string()).collect()
    }

    /// The waiting or active service with this id.
    pub fn service(&self, id: &str) -> Option<Service> {
        self.lock().find(id).cloned()
    }

    fn options(&self) -> SocketOptions {
        SocketOptions::from_config(&self.inner.config, self.inner.role, Arc::clone(&self.inner.codec))
    }

    /// Adapt `existing`, or dial `host:port` when `None`.
    /// No-op (returns `false`) unless disconnected.
    pub fn connect(&self, existing: Option<TcpStream>) -> bool {
        let dialed = existing.is_none();
        self.start(dialed, |options| Socket::connect(options, existing))
    }

    /// Run over any already open byte stream.
    pub fn connect_with<S>(&self, stream: S) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.start(false, |options| Socket::attach(options, stream))
    }

    fn start<F>(&self, dialed: bool, open: F) -> bool
    where
        F: FnOnce(SocketOptions) -> (Socket, SocketEvents),
    {
        let (generation, events) = {
            let mut state = self.lock();
            if state.status != TunnelState::Disconnected {
                return false;
            }
            state.status = TunnelState::Connecting;
            state.generation += 1;
            state.dialed = dialed;
            state.user_disconnect = false;
            let (socket, events) = open(self.options());
            state.socket = Some(socket);
            (state.generation, events)
        };

        tracing::debug!(
            origin = %self.origin(),
            role = %self.inner.role,
            transport = ?self.inner.config.transport,
            "Tunnel connecting"
        );
        tokio::spawn(pump(Arc::clone(&self.inner), generation, events));
        true
    }

    /// Tear down the socket, unplug every service and fire `disconnect`.
    /// Also cancels a pending reconnect. `false` when already disconnected.
    pub fn disconnect(&self) -> bool {
        let (socket, services) = {
            let mut state = self.lock();
            state.user_disconnect = true;
            if state.status == TunnelState::Disconnected {
                return false;
            }
            state.status = TunnelState::Disconnected;
            state.generation += 1;
            (state.socket.take(), state.drain())
        };

        if let Some(socket) = socket {
            socket.disconnect();
        }
        tracing::info!(origin = %self.origin(), "Tunnel disconnected by request");
        self.finish_disconnect(services);
        true
    }

    fn finish_disconnect(&self, services: Vec<Service>) {
        for service in &services {
            service.mark_unplugged();
        }
        self.inner.events.disconnect.trigger(&());
    }

    /// Encode `value` and send it with `headers`; `id`, `event` and
    /// `method` keys become their `@service-*` wire names.
    pub fn send(&self, value: Value, headers: HeaderMap) -> bool {
        let socket = match &self.lock().socket {
            Some(socket) => socket.clone(),
            None => return false,
        };
        let Some(payload) = self.inner.codec.encode(&value) else {
            tracing::warn!(codec = self.inner.codec.name(), "Value could not be encoded");
            return false;
        };
        socket.send(payload, wire_headers(headers))
    }

    fn send_control(&self, id: &str, method: &str) -> bool {
        let mut headers = HeaderMap::new();
        headers.insert(SERVICE_ID.to_string(), Value::from(id));
        headers.insert(SERVICE_METHOD.to_string(), Value::from(method));
        self.send(Value::map(), headers)
    }

    /// Track `service` and ask the peer to plug it. Idempotent per id.
    pub fn add_service(&self, service: &Service) -> bool {
        if !service.belongs_to(self) {
            tracing::warn!(service = %service.id(), "Service belongs to another tunnel");
            return false;
        }
        let (promote, announce) = {
            let mut state = self.lock();
            if state.find(service.id()).is_some() {
                return false;
            }
            let promote = state.requested.remove(service.id());
            if promote {
                state.active.push(service.clone());
            } else {
                state.waiting.push(service.clone());
            }
            (promote, state.status == TunnelState::Connected)
        };

        tracing::debug!(service = %service.id(), promote, announce, "Service added");
        if promote {
            service.mark_plugged();
        }
        if announce {
            self.send_control(service.id(), PLUG);
        }
        true
    }

    /// Ask the peer to unplug `service`. It stays until the peer echoes,
    /// unless the tunnel is not connected, in which case it goes at once.
    pub fn remove_service(&self, service: &Service) -> bool {
        let connected = {
            let mut state = self.lock();
            match state.find(service.id()) {
                Some(known) if known.ptr_eq(service) => {}
                _ => return false,
            }
            let connected = state.status == TunnelState::Connected;
            if connected {
                state.unplugging.insert(service.id().to_string());
            } else {
                state.take(service.id());
            }
            connected
        };

        if connected && self.send_control(service.id(), UNPLUG) {
            tracing::debug!(service = %service.id(), "Unplug requested");
            return true;
        }
        if connected {
            let mut state = self.lock();
            state.unplugging.remove(service.id());
            state.take(service.id());
        }
        service.mark_unplugged();
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn on_connect(&self, generation: u64) {
        let waiting: Vec<String> = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.status = TunnelState::Connected;
            state.failures = 0;
            state.waiting.iter().map(|s| s.id().to_string()).collect()
        };

        tracing::info!(origin = %self.origin(), role = %self.inner.role, "Tunnel connected");
        self.inner.events.connect.trigger(&());
        for id in waiting {
            self.send_control(&id, PLUG);
        }
    }

    fn on_error(&self, generation: u64, error: TransportError) {
        if !self.is_current(generation) {
            return;
        }
        tracing::warn!(origin = %self.origin(), error = %error, "Tunnel transport error");
        self.inner.events.error.trigger(&error);
    }

    fn on_disconnect(&self, generation: u64) {
        let (services, retry) = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.status = TunnelState::Disconnected;
            state.socket = None;
            state.generation += 1;
            let retry = self.reconnect_delay(&mut state);
            (state.drain(), retry.map(|delay| (delay, state.generation)))
        };

        tracing::info!(origin = %self.origin(), "Tunnel disconnected");
        self.finish_disconnect(services);
        if let Some((delay, generation)) = retry {
            self.schedule_reconnect(delay, generation);
        }
    }

    fn reconnect_delay(&self, state: &mut State) -> Option<Duration> {
        let reconnect = &self.inner.config.reconnect;
        if self.inner.role != Role::Client
            || !state.dialed
            || state.user_disconnect
            || reconnect.delay_ms == 0
        {
            return None;
        }
        state.failures = state.failures.saturating_add(1);
        Some(calculate_backoff(
            state.failures,
            reconnect.delay_ms,
            reconnect.max_delay_ms,
        ))
    }

    fn schedule_reconnect(&self, delay: Duration, generation: u64) {
        metrics::record_reconnect();
        tracing::info!(
            origin = %self.origin(),
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        let weak = self.downgrade();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(tunnel) = weak.upgrade() else {
                return;
            };
            let due = {
                let state = tunnel.lock();
                state.generation == generation
                    && state.status == TunnelState::Disconnected
                    && !state.user_disconnect
            };
            if due {
                tunnel.connect(None);
            }
        });
    }

    fn on_receive(&self, generation: u64, payload: Vec<u8>, headers: HeaderMap) {
        if !self.is_current(generation) {
            return;
        }
        let value = if payload.is_empty() {
            Value::map()
        } else {
            match self.inner.codec.decode(&payload) {
                Some(Value::Null) | None => Value::map(),
                Some(value) => value,
            }
        };
        self.route(Message { value, headers });
    }

    fn route(&self, message: Message) {
        let Some(id) = message.service_id().map(str::to_string) else {
            self.inner.events.receive.trigger(&message);
            return;
        };

        match message.method() {
            Some(PLUG) => self.on_plug(&id, &message),
            Some(UNPLUG) => self.on_unplug(&id, &message),
            _ => {
                let target = self.lock().find(&id).cloned();
                let handled = target.is_some_and(|service| service.dispatch(&message));
                if !handled {
                    self.inner.events.receive.trigger(&message);
                }
            }
        }
    }

    fn on_plug(&self, id: &str, message: &Message) {
        let promoted = {
            let mut state = self.lock();
            match state.waiting.iter().position(|s| s.id() == id) {
                Some(index) => {
                    let service = state.waiting.remove(index);
                    state.active.push(service.clone());
                    Some(service)
                }
                None if state.find(id).is_some() => return,
                None => {
                    state.requested.insert(id.to_string());
                    None
                }
            }
        };

        match promoted {
            Some(service) => service.mark_plugged(),
            None => {
                tracing::debug!(service = %id, "Peer plugged an unknown service");
                self.inner.events.plug_requested.trigger(&id.to_string());
                self.inner.events.receive.trigger(message);
            }
        }
    }

    fn on_unplug(&self, id: &str, message: &Message) {
        let (removed, initiated) = {
            let mut state = self.lock();
            state.requested.remove(id);
            (state.take(id), state.unplugging.remove(id))
        };

        let Some(service) = removed else {
            tracing::debug!(service = %id, "Unplug for unknown service");
            self.inner.events.receive.trigger(message);
            return;
        };
        service.mark_unplugged();
        if !initiated {
            self.send_control(id, UNPLUG);
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("origin", &self.origin())
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

impl WeakTunnel {
    pub fn upgrade(&self) -> Option<Tunnel> {
        self.inner.upgrade().map(|inner| Tunnel { inner })
    }

    pub(crate) fn points_to(&self, tunnel: &Tunnel) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&tunnel.inner))
    }
}

impl std::fmt::Debug for WeakTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakTunnel")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// Forward socket events into the tunnel until the socket ends.
async fn pump(inner: Arc<Inner>, generation: u64, mut events: SocketEvents) {
    let tunnel = Tunnel { inner };
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Connect => tunnel.on_connect(generation),
            SocketEvent::Receive { payload, headers } => tunnel.on_receive(generation, payload, headers),
            SocketEvent::Error(error) => tunnel.on_error(generation, error),
            SocketEvent::Disconnect => {
                tunnel.on_disconnect(generation);
                break;
            }
        }
    }
}

fn wire_headers(headers: HeaderMap) -> HeaderMap {
    headers
        .into_iter()
        .map(|(key, value)| {
            let wire = RESERVED_HEADERS
                .iter()
                .find(|(name, _)| *name == key)
                .map_or(key, |(_, wire)| wire.to_string());
            (wire, value)
        })
        .collect()
}
