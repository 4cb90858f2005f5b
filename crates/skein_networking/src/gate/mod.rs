//! # Session Gate
//!
//! Gives every connection its own session object and routes that
//! connection's messages to it.
//!
//! ## Design
//!
//! ```text
//!   Server::update_with(gate sink)
//!     Connected ──> factory(&Connection) ──> Session::on_connected
//!     Data ───────> registry handler(&mut session, ctx, id, msg)
//!                   └─ not registered ─> server's own handlers
//!     Disconnected ─> Session::on_disconnected, session dropped
//! ```
//!
//! - The registry is built once per session type; dispatch is a table
//!   lookup by message id
//! - A session lives exactly as long as its connection
//! - Messages for connections without a session are dropped

mod registry;

pub use registry::SessionRegistry;

use std::collections::BTreeMap;

use skein_core::codec::{decode, encode_payload, split_frame, Message, MessageId};
use tracing::{debug, info, trace};

use crate::connection::{Connection, ConnectionId};
use crate::peer::{Dispatch, Server, ServerContext, ServerSink};

/// Per-connection state owned by a [`SessionGate`].
pub trait Session: 'static {
    /// The connection was accepted and the session created.
    fn on_connected(&mut self, _ctx: &mut ServerContext<'_>, _connection: &Connection) {}

    /// The connection closed; the session is dropped afterwards.
    fn on_disconnected(&mut self, _id: ConnectionId) {}
}

type Factory<S> = Box<dyn FnMut(&Connection) -> S>;

/// A [`Server`] with one `S` per connection.
pub struct SessionGate<S: Session> {
    server: Server,
    registry: SessionRegistry<S>,
    factory: Factory<S>,
    sessions: BTreeMap<ConnectionId, S>,
}

impl<S: Session> SessionGate<S> {
    /// Wraps `server`. `factory` creates the session for each new
    /// connection.
    pub fn new(server: Server, registry: SessionRegistry<S>, factory: impl FnMut(&Connection) -> S + 'static) -> Self {
        Self {
            server,
            registry,
            factory: Box::new(factory),
            sessions: BTreeMap::new(),
        }
    }

    /// Runs one server update, routing registered messages to sessions.
    pub fn update(&mut self) {
        let mut sink = GateSink {
            registry: &mut self.registry,
            factory: &mut self.factory,
            sessions: &mut self.sessions,
        };
        self.server.update_with(&mut sink);
    }

    /// Session of `id`.
    #[must_use]
    pub fn session(&self, id: ConnectionId) -> Option<&S> {
        self.sessions.get(&id)
    }

    /// Mutable session of `id`.
    pub fn session_mut(&mut self, id: ConnectionId) -> Option<&mut S> {
        self.sessions.get_mut(&id)
    }

    /// Every session, in connection id order.
    pub fn sessions(&self) -> impl Iterator<Item = (ConnectionId, &S)> + '_ {
        self.sessions.iter().map(|(id, session)| (*id, session))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs the `Req` handler of `id`'s session locally, without touching
    /// the wire.
    ///
    /// Returns `Resp::default()` when the session is gone, no handler is
    /// registered, or the handler answers with a different type.
    pub fn invoke<Req: Message, Resp: Message>(&mut self, id: ConnectionId, request: &Req) -> Resp {
        let Some(session) = self.sessions.get_mut(&id) else {
            debug!(%id, "Invoke on missing session");
            return Resp::default();
        };
        let Some(handler) = self.registry.requests.get_mut(Req::ID) else {
            debug!(%id, message = %Req::ID, "Invoke without request handler");
            return Resp::default();
        };
        let Some(mut ctx) = self.server.context() else {
            return Resp::default();
        };

        let mut payload = Vec::new();
        if encode_payload(request, &mut payload).is_err() {
            return Resp::default();
        }
        let mut out = Vec::new();
        if !handler(session, &mut ctx, id, payload.as_slice(), &mut out) {
            return Resp::default();
        }
        match split_frame(&out) {
            Ok((message, body)) if message == Resp::ID => decode(body).unwrap_or_default(),
            _ => {
                debug!(%id, expected = %Resp::ID, "Invoke answered with another type");
                Resp::default()
            }
        }
    }

    /// The wrapped server.
    #[must_use]
    pub const fn server(&self) -> &Server {
        &self.server
    }

    /// The wrapped server, for registration and sending.
    pub fn server_mut(&mut self) -> &mut Server {
        &mut self.server
    }

    /// Shuts the server down, ending every session.
    pub fn shutdown(&mut self) {
        self.server.shutdown();
        let sessions = std::mem::take(&mut self.sessions);
        let count = sessions.len();
        for (id, mut session) in sessions {
            session.on_disconnected(id);
        }
        info!(sessions = count, "Session gate shut down");
    }
}

struct GateSink<'a, S: Session> {
    registry: &'a mut SessionRegistry<S>,
    factory: &'a mut Factory<S>,
    sessions: &'a mut BTreeMap<ConnectionId, S>,
}

impl<S: Session> ServerSink for GateSink<'_, S> {
    fn on_connected(&mut self, ctx: &mut ServerContext<'_>, connection: &Connection) {
        let mut session = (self.factory)(connection);
        session.on_connected(ctx, connection);
        self.sessions.insert(connection.id, session);
    }

    fn on_disconnected(&mut self, id: ConnectionId) {
        if let Some(mut session) = self.sessions.remove(&id) {
            session.on_disconnected(id);
        }
    }

    fn on_message(
        &mut self,
        ctx: &mut ServerContext<'_>,
        id: ConnectionId,
        message: MessageId,
        payload: &[u8],
    ) -> Dispatch {
        let Some(handler) = self.registry.handlers.get_mut(message) else {
            return Dispatch::Unhandled;
        };
        let Some(session) = self.sessions.get_mut(&id) else {
            trace!(%id, %message, "No session, message dropped");
            return Dispatch::Failed;
        };
        if handler(session, ctx, id, payload) {
            Dispatch::Handled
        } else {
            Dispatch::Failed
        }
    }

    fn on_request(
        &mut self,
        ctx: &mut ServerContext<'_>,
        id: ConnectionId,
        message: MessageId,
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> Dispatch {
        let Some(handler) = self.registry.requests.get_mut(message) else {
            return Dispatch::Unhandled;
        };
        let Some(session) = self.sessions.get_mut(&id) else {
            trace!(%id, %message, "No session, request dropped");
            return Dispatch::Failed;
        };
        if handler(session, ctx, id, payload, out) {
            Dispatch::Handled
        } else {
            Dispatch::Failed
        }
    }
}
