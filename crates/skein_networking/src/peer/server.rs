//! Server peer.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use skein_core::codec::{split_frame, Message, MessageId, FRAME_HEADER_SIZE};
use skein_core::{BufferPool, Packet};
use tracing::{debug, info, trace, warn};

use super::context::ServerContext;
use super::handlers::{message_fn, request_fn, HandlerTable, MessageFn, RequestFn};
use super::rpc::{parse_rpc, write_rpc_header, RPC_HEADER_SIZE};
use super::{Dispatch, PeerState, ServerSink};
use crate::blacklist::Blacklist;
use crate::config::{NetSettings, Protocol};
use crate::connection::{Connection, ConnectionId};
use crate::endpoint::{EndPoint, FanOutCall, PendingCall};
use crate::wire::{self, StartMode, WireEvent, WirePeer};

type ConnectedObserver = Box<dyn FnMut(&Connection)>;
type DisconnectedObserver = Box<dyn FnMut(ConnectionId)>;

/// Accepts connections and dispatches their frames to registered handlers.
///
/// ```no_run
/// use skein_networking::{NetSettings, Protocol, Server};
/// use skein_shared::{Ping, Pong};
///
/// let mut server = Server::new(NetSettings::default());
/// server.initialize(Protocol::Stream);
/// server.register_handler::<Ping, _>(|ctx, id, ping| {
///     ctx.send(id, &Pong::answer(ping));
/// });
/// server.start(7777, 32);
/// loop {
///     server.update();
///     std::thread::sleep(std::time::Duration::from_millis(16));
/// }
/// ```
pub struct Server {
    settings: NetSettings,
    pool: Arc<BufferPool>,
    wire: Option<Box<dyn WirePeer>>,
    state: PeerState,
    connections: BTreeMap<ConnectionId, Connection>,
    /// Blacklisted connections awaiting their disconnect event.
    rejected: HashSet<ConnectionId>,
    endpoint: EndPoint,
    handlers: HandlerTable<MessageFn<()>>,
    requests: HandlerTable<RequestFn<()>>,
    connected_observers: Vec<ConnectedObserver>,
    disconnected_observers: Vec<DisconnectedObserver>,
    blacklist: Blacklist,
    events: Vec<WireEvent>,
}

impl Server {
    /// Creates a server with its own buffer pool.
    #[must_use]
    pub fn new(settings: NetSettings) -> Self {
        let pool = Arc::new(BufferPool::with_retention(settings.max_buffers_per_bucket));
        Self::with_pool(settings, pool)
    }

    /// Creates a server sharing `pool`.
    ///
    /// Loads the blacklist named in `settings`; a file that fails to load
    /// is logged and treated as empty.
    #[must_use]
    pub fn with_pool(settings: NetSettings, pool: Arc<BufferPool>) -> Self {
        let blacklist = match &settings.blacklist_path {
            Some(path) => Blacklist::load(path).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "Failed to load blacklist");
                Blacklist::new()
            }),
            None => Blacklist::new(),
        };
        Self {
            settings,
            pool,
            wire: None,
            state: PeerState::Uninitialized,
            connections: BTreeMap::new(),
            rejected: HashSet::new(),
            endpoint: EndPoint::new(),
            handlers: HandlerTable::new(),
            requests: HandlerTable::new(),
            connected_observers: Vec::new(),
            disconnected_observers: Vec::new(),
            blacklist,
            events: Vec::new(),
        }
    }

    /// Picks the wire protocol.
    pub fn initialize(&mut self, protocol: Protocol) -> bool {
        match wire::create(protocol, &self.settings, Arc::clone(&self.pool)) {
            Some(wire) => self.initialize_with(wire),
            None => {
                warn!(%protocol, "Protocol not available on this target");
                false
            }
        }
    }

    /// Uses a caller-provided wire peer.
    pub fn initialize_with(&mut self, wire: Box<dyn WirePeer>) -> bool {
        if self.state.is_active() {
            warn!(state = ?self.state, "Cannot initialize a running server");
            return false;
        }
        info!(protocol = %wire.protocol(), "Server initialized");
        self.wire = Some(wire);
        self.state = PeerState::Initialized;
        true
    }

    /// Starts listening on the configured address.
    pub fn start(&mut self, port: u16, max_clients: usize) -> bool {
        if !matches!(self.state, PeerState::Initialized | PeerState::Shutdown) {
            warn!(state = ?self.state, "Server cannot start from this state");
            return false;
        }
        let Some(wire) = self.wire.as_mut() else {
            warn!("Server has no wire peer");
            return false;
        };
        let mode = StartMode::Listen {
            address: self.settings.bind_address().to_string(),
            port,
            max_clients,
        };
        match wire.start(mode) {
            Ok(()) => {
                self.state = PeerState::Listening;
                info!(protocol = %wire.protocol(), address = ?wire.local_addr(), max_clients, "Server started");
                true
            }
            Err(err) => {
                warn!(port, error = %err, "Server failed to start");
                false
            }
        }
    }

    /// Starts with `settings`, initializing the protocol it names if needed.
    ///
    /// Fails when already initialized with a different protocol.
    pub fn start_with(&mut self, settings: &NetSettings) -> bool {
        if self.wire.is_none() && !self.initialize(settings.protocol) {
            return false;
        }
        let protocol = self.wire.as_ref().map(|wire| wire.protocol());
        if protocol != Some(settings.protocol) {
            warn!(expected = %settings.protocol, actual = ?protocol, "Protocol mismatch");
            return false;
        }
        self.settings = settings.clone();
        self.start(settings.port, settings.max_clients)
    }

    /// Dispatches everything the wire queued since the last call and
    /// expires overdue calls.
    pub fn update(&mut self) {
        self.update_with(&mut ());
    }

    /// Like [`update`](Self::update), offering every event to `sink`
    /// before the server's own handlers and observers.
    pub fn update_with(&mut self, sink: &mut dyn ServerSink) {
        if !self.state.is_active() {
            return;
        }
        self.state = PeerState::Running;

        let mut events = std::mem::take(&mut self.events);
        if let Some(wire) = self.wire.as_mut() {
            wire.poll(&mut events);
        }

        let mut handlers = std::mem::take(&mut self.handlers);
        let mut requests = std::mem::take(&mut self.requests);
        for event in events.drain(..) {
            match event {
                WireEvent::Connected { id, address } => self.handle_connected(sink, id, address),
                WireEvent::Data { id, packet } => {
                    if self.connections.contains_key(&id) {
                        self.dispatch(sink, &mut handlers, &mut requests, id, packet.as_slice());
                    } else {
                        trace!(%id, "Frame from unknown connection dropped");
                    }
                    packet.release(&self.pool);
                }
                WireEvent::Disconnected { id } => self.handle_disconnected(sink, id),
            }
        }
        self.handlers = handlers;
        self.requests = requests;
        self.events = events;

        let expired = self.endpoint.expire(Instant::now());
        if expired > 0 {
            debug!(expired, "Calls timed out");
        }
    }

    pub(crate) fn context(&mut self) -> Option<ServerContext<'_>> {
        Some(ServerContext {
            wire: self.wire.as_deref_mut()?,
            pool: &self.pool,
            connections: &self.connections,
            endpoint: &mut self.endpoint,
            settings: &self.settings,
        })
    }

    fn handle_connected(&mut self, sink: &mut dyn ServerSink, id: ConnectionId, address: SocketAddr) {
        if self.blacklist.contains(address.ip()) {
            info!(%id, %address, "Refusing blacklisted address");
            self.rejected.insert(id);
            if let Some(wire) = self.wire.as_mut() {
                wire.disconnect(id);
            }
            return;
        }

        let connection = Connection::new(id, address);
        self.connections.insert(id, connection);
        info!(%id, %address, clients = self.connections.len(), "Client connected");

        if let Some(mut ctx) = self.context() {
            sink.on_connected(&mut ctx, &connection);
        }
        for observer in &mut self.connected_observers {
            observer(&connection);
        }
    }

    fn handle_disconnected(&mut self, sink: &mut dyn ServerSink, id: ConnectionId) {
        if self.rejected.remove(&id) {
            return;
        }
        if self.connections.remove(&id).is_none() {
            debug!(%id, "Disconnect for unknown connection");
            return;
        }
        let cancelled = self.endpoint.cancel_for(id);
        sink.on_disconnected(id);
        for observer in &mut self.disconnected_observers {
            observer(id);
        }
        info!(%id, cancelled, clients = self.connections.len(), "Client disconnected");
    }

    fn dispatch(
        &mut self,
        sink: &mut dyn ServerSink,
        handlers: &mut HandlerTable<MessageFn<()>>,
        requests: &mut HandlerTable<RequestFn<()>>,
        id: ConnectionId,
        frame: &[u8],
    ) {
        let Some(mut ctx) = self.context() else {
            return;
        };
        let Ok((message, payload)) = split_frame(frame) else {
            warn!(%id, len = frame.len(), "Undersized frame, disconnecting");
            ctx.disconnect(id);
            return;
        };
        trace!(%id, %message, len = payload.len(), "Frame received");

        match message {
            MessageId::RPC_REQUEST => serve_request(&mut ctx, sink, requests, id, payload),
            MessageId::RPC_RESPONSE => match parse_rpc(payload) {
                Some((header, inner)) => {
                    ctx.endpoint.set_result_from(header.serial, id, header.cookie, inner);
                }
                None => debug!(%id, "Malformed response dropped"),
            },
            _ => match sink.on_message(&mut ctx, id, message, payload) {
                Dispatch::Handled => {}
                Dispatch::Failed => debug!(%id, %message, "Message dropped"),
                Dispatch::Unhandled => match handlers.get_mut(message) {
                    Some(handler) => {
                        handler(&mut (), &mut ctx, id, payload);
                    }
                    None => debug!(%id, %message, "No handler, message dropped"),
                },
            },
        }
    }

    /// Stops the wire, cancels pending calls and reports every connection
    /// as disconnected.
    pub fn shutdown(&mut self) {
        if let Some(wire) = self.wire.as_mut() {
            wire.shutdown();
        }
        let cancelled = self.endpoint.clear();
        let connections = std::mem::take(&mut self.connections);
        for id in connections.keys() {
            for observer in &mut self.disconnected_observers {
                observer(*id);
            }
        }
        self.rejected.clear();
        if self.state != PeerState::Uninitialized {
            self.state = PeerState::Shutdown;
        }
        info!(clients = connections.len(), cancelled, "Server shut down");
    }

    /// Registers the handler for messages of type `T`.
    ///
    /// Returns false if `T` already has a handler.
    pub fn register_handler<T, F>(&mut self, mut handler: F) -> bool
    where
        T: Message,
        F: FnMut(&mut ServerContext<'_>, ConnectionId, &T) + 'static,
    {
        let erased = message_fn::<(), T, _>(move |_, ctx, id, message| handler(ctx, id, message));
        self.handlers.insert_typed::<T>(erased)
    }

    /// Removes the handler for `T`.
    pub fn unregister_handler<T: Message>(&mut self) -> bool {
        self.handlers.remove(T::ID)
    }

    /// Registers the handler answering `Req` requests with a `Resp`.
    pub fn register_request_handler<Req, Resp, F>(&mut self, mut handler: F) -> bool
    where
        Req: Message,
        Resp: Message,
        F: FnMut(&mut ServerContext<'_>, ConnectionId, &Req) -> Resp + 'static,
    {
        let erased = request_fn::<(), Req, Resp, _>(move |_, ctx, id, request| handler(ctx, id, request));
        self.requests.claim::<Resp>() && self.requests.insert_typed::<Req>(erased)
    }

    /// Removes the request handler for `Req`.
    pub fn unregister_request_handler<Req: Message>(&mut self) -> bool {
        self.requests.remove(Req::ID)
    }

    /// Adds an observer for new connections. Observers run in
    /// registration order.
    pub fn on_connected(&mut self, observer: impl FnMut(&Connection) + 'static) {
        self.connected_observers.push(Box::new(observer));
    }

    /// Adds an observer for closed connections.
    pub fn on_disconnected(&mut self, observer: impl FnMut(ConnectionId) + 'static) {
        self.disconnected_observers.push(Box::new(observer));
    }

    /// Sends `message` to one connection.
    pub fn send<T: Message>(&mut self, id: ConnectionId, message: &T) -> bool {
        self.context().is_some_and(|mut ctx| ctx.send(id, message))
    }

    /// Sends `message` to every connection.
    pub fn broadcast<T: Message>(&mut self, message: &T) -> usize {
        self.context().map_or(0, |mut ctx| ctx.broadcast(message))
    }

    /// Sends `message` to the listed connections.
    pub fn broadcast_to<T: Message>(&mut self, ids: &[ConnectionId], message: &T) -> usize {
        self.context().map_or(0, |mut ctx| ctx.broadcast_to(ids, message))
    }

    /// Sends a request to one connection.
    pub fn call<Req: Message, Resp: Message>(
        &mut self,
        id: ConnectionId,
        request: &Req,
        timeout: Duration,
    ) -> Option<PendingCall<Resp>> {
        self.context()?.call(id, request, timeout)
    }

    /// Sends a request to several connections.
    pub fn call_many<Req: Message, Resp: Message>(
        &mut self,
        ids: &[ConnectionId],
        request: &Req,
        timeout: Duration,
    ) -> Option<FanOutCall<Resp>> {
        self.context()?.call_many(ids, request, timeout)
    }

    /// Closes a connection; observers run on a later update.
    pub fn disconnect(&mut self, id: ConnectionId) -> bool {
        self.context().is_some_and(|mut ctx| ctx.disconnect(id))
    }

    /// Round-trip time to `id` in milliseconds, 0 if unknown.
    #[must_use]
    pub fn round_trip_time(&self, id: ConnectionId) -> u32 {
        self.wire.as_ref().map_or(0, |wire| wire.round_trip_time(id))
    }

    /// Connection by id.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Every live connection, in id order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.connections.values()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Outstanding calls.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.endpoint.len()
    }

    /// Bound address once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.wire.as_ref().and_then(|wire| wire.local_addr())
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> PeerState {
        self.state
    }

    /// Active settings.
    #[must_use]
    pub const fn settings(&self) -> &NetSettings {
        &self.settings
    }

    /// Buffer pool shared with the wire.
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Blocked addresses.
    #[must_use]
    pub const fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Blocked addresses, for edits at runtime. Existing connections are
    /// not affected.
    pub fn blacklist_mut(&mut self) -> &mut Blacklist {
        &mut self.blacklist
    }
}

/// Runs a request through `sink` or the request handlers and sends the
/// response. Requests nobody answers time out on the caller's side.
pub(crate) fn serve_request<S: ServerSink + ?Sized>(
    ctx: &mut ServerContext<'_>,
    sink: &mut S,
    requests: &mut HandlerTable<RequestFn<()>>,
    id: ConnectionId,
    payload: &[u8],
) {
    let Some((header, inner)) = parse_rpc(payload) else {
        debug!(%id, "Malformed request dropped");
        return;
    };
    let Ok((message, body)) = split_frame(inner) else {
        return;
    };

    let mut buffer = ctx.pool.rent(2 * FRAME_HEADER_SIZE + RPC_HEADER_SIZE);
    write_rpc_header(buffer.as_mut_vec(), MessageId::RPC_RESPONSE, header);
    let answered = match sink.on_request(ctx, id, message, body, buffer.as_mut_vec()) {
        Dispatch::Handled => true,
        Dispatch::Failed => false,
        Dispatch::Unhandled => match requests.get_mut(message) {
            Some(handler) => handler(&mut (), &mut *ctx, id, body, buffer.as_mut_vec()),
            None => {
                debug!(%id, %message, "No request handler, request dropped");
                false
            }
        },
    };

    if answered && buffer.len() >= 2 * FRAME_HEADER_SIZE + RPC_HEADER_SIZE {
        ctx.send_packet(id, Packet::new(buffer));
    } else {
        ctx.pool.give_back(buffer);
    }
}
