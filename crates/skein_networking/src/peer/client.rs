//! Client peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use skein_core::codec::{split_frame, Message, MessageId, FRAME_HEADER_SIZE};
use skein_core::memory::ObjectPool;
use skein_core::{BufferPool, Packet};
use tracing::{debug, info, trace, warn};

use super::context::ClientContext;
use super::handlers::{encode_response, with_decoded, HandlerTable, MESSAGE_POOL_CAPACITY};
use super::rpc::{parse_rpc, write_rpc_header, RPC_HEADER_SIZE};
use super::PeerState;
use crate::config::{NetSettings, Protocol};
use crate::connection::{Connection, ConnectionId};
use crate::endpoint::{EndPoint, PendingCall};
use crate::wire::{self, StartMode, WireEvent, WirePeer};

type ClientMessageFn = Box<dyn FnMut(&mut ClientContext<'_>, &[u8]) -> bool>;
type ClientRequestFn = Box<dyn FnMut(&mut ClientContext<'_>, &[u8], &mut Vec<u8>) -> bool>;

fn client_message_bound<F>(f: F) -> F
where
    F: FnMut(&mut ClientContext<'_>, &[u8]) -> bool,
{
    f
}

fn client_request_bound<F>(f: F) -> F
where
    F: FnMut(&mut ClientContext<'_>, &[u8], &mut Vec<u8>) -> bool,
{
    f
}

/// Connects to one server and dispatches its frames.
///
/// A failed or lost connection returns the client to
/// [`PeerState::Initialized`], so `start` can be called again.
pub struct Client {
    settings: NetSettings,
    pool: Arc<BufferPool>,
    wire: Option<Box<dyn WirePeer>>,
    state: PeerState,
    connection: Option<Connection>,
    connected: AtomicBool,
    endpoint: EndPoint,
    handlers: HandlerTable<ClientMessageFn>,
    requests: HandlerTable<ClientRequestFn>,
    connected_observers: Vec<Box<dyn FnMut(&Connection)>>,
    disconnected_observers: Vec<Box<dyn FnMut()>>,
    events: Vec<WireEvent>,
}

impl Client {
    /// Creates a client with its own buffer pool.
    #[must_use]
    pub fn new(settings: NetSettings) -> Self {
        let pool = Arc::new(BufferPool::with_retention(settings.max_buffers_per_bucket));
        Self::with_pool(settings, pool)
    }

    /// Creates a client sharing `pool`.
    #[must_use]
    pub fn with_pool(settings: NetSettings, pool: Arc<BufferPool>) -> Self {
        Self {
            settings,
            pool,
            wire: None,
            state: PeerState::Uninitialized,
            connection: None,
            connected: AtomicBool::new(false),
            endpoint: EndPoint::new(),
            handlers: HandlerTable::new(),
            requests: HandlerTable::new(),
            connected_observers: Vec::new(),
            disconnected_observers: Vec::new(),
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
            warn!(state = ?self.state, "Cannot initialize a running client");
            return false;
        }
        debug!(protocol = %wire.protocol(), "Client initialized");
        self.wire = Some(wire);
        self.state = PeerState::Initialized;
        true
    }

    /// Begins connecting to `address:port`. The outcome arrives through
    /// the connected or disconnected observers.
    pub fn start(&mut self, address: &str, port: u16) -> bool {
        if !matches!(self.state, PeerState::Initialized | PeerState::Shutdown) {
            warn!(state = ?self.state, "Client cannot start from this state");
            return false;
        }
        let Some(wire) = self.wire.as_mut() else {
            warn!("Client has no wire peer");
            return false;
        };
        let mode = StartMode::Connect {
            address: address.to_string(),
            port,
        };
        match wire.start(mode) {
            Ok(()) => {
                self.state = PeerState::Running;
                info!(protocol = %wire.protocol(), address, port, "Connecting");
                true
            }
            Err(err) => {
                warn!(address, port, error = %err, "Client failed to start");
                false
            }
        }
    }

    /// Starts with `settings`, initializing the protocol it names if needed.
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
        self.start(&settings.address, settings.port)
    }

    /// Dispatches queued events and expires overdue calls.
    pub fn update(&mut self) {
        if !self.state.is_active() {
            return;
        }

        let mut events = std::mem::take(&mut self.events);
        if let Some(wire) = self.wire.as_mut() {
            wire.poll(&mut events);
        }

        let mut handlers = std::mem::take(&mut self.handlers);
        let mut requests = std::mem::take(&mut self.requests);
        for event in events.drain(..) {
            match event {
                WireEvent::Connected { id, address } => self.handle_connected(id, address),
                WireEvent::Data { packet, .. } => {
                    if self.connection.is_some() {
                        self.dispatch(&mut handlers, &mut requests, packet.as_slice());
                    }
                    packet.release(&self.pool);
                }
                WireEvent::Disconnected { .. } => self.handle_disconnected(),
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

    fn context(&mut self) -> Option<ClientContext<'_>> {
        Some(ClientContext {
            wire: self.wire.as_deref_mut()?,
            pool: &self.pool,
            connection: self.connection.as_ref(),
            endpoint: &mut self.endpoint,
            settings: &self.settings,
        })
    }

    fn handle_connected(&mut self, id: ConnectionId, address: SocketAddr) {
        let connection = Connection::new(id, address);
        self.connection = Some(connection);
        self.state = PeerState::Connected;
        if self.connected.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(%address, "Connected to server");
        for observer in &mut self.connected_observers {
            observer(&connection);
        }
    }

    fn handle_disconnected(&mut self) {
        self.connection = None;
        let cancelled = self.endpoint.cancel_for(ConnectionId::SERVER);
        if let Some(wire) = self.wire.as_mut() {
            wire.shutdown();
        }
        self.state = PeerState::Initialized;

        if self.connected.swap(false, Ordering::AcqRel) {
            info!(cancelled, "Disconnected from server");
            for observer in &mut self.disconnected_observers {
                observer();
            }
        } else {
            warn!("Connection attempt failed");
        }
    }

    fn dispatch(
        &mut self,
        handlers: &mut HandlerTable<ClientMessageFn>,
        requests: &mut HandlerTable<ClientRequestFn>,
        frame: &[u8],
    ) {
        let Some(mut ctx) = self.context() else {
            return;
        };
        let Ok((message, payload)) = split_frame(frame) else {
            warn!(len = frame.len(), "Undersized frame from server, disconnecting");
            ctx.disconnect();
            return;
        };
        trace!(%message, len = payload.len(), "Frame received");

        match message {
            MessageId::RPC_REQUEST => serve_request(&mut ctx, requests, payload),
            MessageId::RPC_RESPONSE => match parse_rpc(payload) {
                Some((header, inner)) => {
                    ctx.endpoint
                        .set_result_from(header.serial, ConnectionId::SERVER, header.cookie, inner);
                }
                None => debug!("Malformed response dropped"),
            },
            _ => match handlers.get_mut(message) {
                Some(handler) => {
                    handler(&mut ctx, payload);
                }
                None => debug!(%message, "No handler, message dropped"),
            },
        }
    }

    /// Closes the connection and stops the wire. Pending calls end as
    /// cancelled.
    pub fn shutdown(&mut self) {
        if let Some(wire) = self.wire.as_mut() {
            wire.shutdown();
        }
        self.connection = None;
        let cancelled = self.endpoint.clear();
        if self.connected.swap(false, Ordering::AcqRel) {
            for observer in &mut self.disconnected_observers {
                observer();
            }
        }
        if self.state != PeerState::Uninitialized {
            self.state = PeerState::Shutdown;
        }
        info!(cancelled, "Client shut down");
    }

    /// Asks the wire to close the connection. Observers run on a later
    /// update.
    pub fn disconnect(&mut self) {
        if let Some(mut ctx) = self.context() {
            ctx.disconnect();
        }
    }

    /// Registers the handler for messages of type `T`.
    pub fn register_handler<T, F>(&mut self, mut handler: F) -> bool
    where
        T: Message,
        F: FnMut(&mut ClientContext<'_>, &T) + 'static,
    {
        let pool = ObjectPool::<T>::new(MESSAGE_POOL_CAPACITY);
        let erased = client_message_bound(move |ctx, payload| {
            with_decoded(&pool, payload, |message| handler(ctx, message)).is_some()
        });
        self.handlers.insert_typed::<T>(Box::new(erased))
    }

    /// Removes the handler for `T`.
    pub fn unregister_handler<T: Message>(&mut self) -> bool {
        self.handlers.remove(T::ID)
    }

    /// Registers the handler answering server requests of type `Req`.
    pub fn register_request_handler<Req, Resp, F>(&mut self, mut handler: F) -> bool
    where
        Req: Message,
        Resp: Message,
        F: FnMut(&mut ClientContext<'_>, &Req) -> Resp + 'static,
    {
        let pool = ObjectPool::<Req>::new(MESSAGE_POOL_CAPACITY);
        let erased = client_request_bound(move |ctx, payload, out| {
            let max_frame_size = ctx.settings().max_frame_size;
            with_decoded(&pool, payload, |request| handler(ctx, request))
                .is_some_and(|response| encode_response(&response, out, max_frame_size))
        });
        self.requests.claim::<Resp>() && self.requests.insert_typed::<Req>(Box::new(erased))
    }

    /// Removes the request handler for `Req`.
    pub fn unregister_request_handler<Req: Message>(&mut self) -> bool {
        self.requests.remove(Req::ID)
    }

    /// Adds an observer for the established connection.
    pub fn on_connected(&mut self, observer: impl FnMut(&Connection) + 'static) {
        self.connected_observers.push(Box::new(observer));
    }

    /// Adds an observer for the lost connection.
    pub fn on_disconnected(&mut self, observer: impl FnMut() + 'static) {
        self.disconnected_observers.push(Box::new(observer));
    }

    /// Sends `message` to the server.
    pub fn send<T: Message>(&mut self, message: &T) -> bool {
        self.context().is_some_and(|mut ctx| ctx.send(message))
    }

    /// Sends a request to the server.
    pub fn call<Req: Message, Resp: Message>(
        &mut self,
        request: &Req,
        timeout: Duration,
    ) -> Option<PendingCall<Resp>> {
        self.context()?.call(request, timeout)
    }

    /// Returns true while connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The server connection, if established.
    #[must_use]
    pub const fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Round-trip time to the server in milliseconds, 0 if unknown.
    #[must_use]
    pub fn round_trip_time(&self) -> u32 {
        self.wire
            .as_ref()
            .map_or(0, |wire| wire.round_trip_time(ConnectionId::SERVER))
    }

    /// Outstanding calls.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.endpoint.len()
    }

    /// Local socket address once started.
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
}

fn serve_request(ctx: &mut ClientContext<'_>, requests: &mut HandlerTable<ClientRequestFn>, payload: &[u8]) {
    let Some((header, inner)) = parse_rpc(payload) else {
        debug!("Malformed request dropped");
        return;
    };
    let Ok((message, body)) = split_frame(inner) else {
        return;
    };

    let overhead = 2 * FRAME_HEADER_SIZE + RPC_HEADER_SIZE;
    let mut buffer = ctx.pool.rent(overhead);
    write_rpc_header(buffer.as_mut_vec(), MessageId::RPC_RESPONSE, header);
    let answered = match requests.get_mut(message) {
        Some(handler) => handler(&mut *ctx, body, buffer.as_mut_vec()),
        None => {
            debug!(%message, "No request handler, request dropped");
            false
        }
    };

    if answered && buffer.len() >= overhead {
        ctx.send_packet(Packet::new(buffer));
    } else {
        ctx.pool.give_back(buffer);
    }
}
