//! Typed handler registration for session types.

use skein_core::codec::{Message, MessageId};

use super::Session;
use crate::connection::ConnectionId;
use crate::peer::{message_fn, request_fn, HandlerTable, MessageFn, RequestFn, ServerContext};

/// Handlers for one session type, built once before the gate starts.
///
/// ```
/// use skein_networking::gate::{Session, SessionRegistry};
/// use skein_shared::{EchoRequest, EchoResponse, Ping};
///
/// #[derive(Default)]
/// struct Player {
///     pings: u32,
/// }
///
/// impl Session for Player {}
///
/// let registry = SessionRegistry::<Player>::new()
///     .on::<Ping, _>(|player, _ctx, _id, _ping| player.pings += 1)
///     .on_request::<EchoRequest, EchoResponse, _>(|player, _ctx, _id, request| EchoResponse {
///         text: request.text.clone(),
///         served: player.pings,
///     });
/// assert_eq!(registry.len(), 2);
/// ```
pub struct SessionRegistry<S> {
    pub(crate) handlers: HandlerTable<MessageFn<S>>,
    pub(crate) requests: HandlerTable<RequestFn<S>>,
}

impl<S: Session> SessionRegistry<S> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HandlerTable::new(),
            requests: HandlerTable::new(),
        }
    }

    /// Routes messages of type `T` to the sender's session. A second
    /// handler for the same type is ignored with a warning.
    #[must_use]
    pub fn on<T, F>(mut self, handler: F) -> Self
    where
        T: Message,
        F: FnMut(&mut S, &mut ServerContext<'_>, ConnectionId, &T) + 'static,
    {
        self.handlers.insert_typed::<T>(message_fn::<S, T, F>(handler));
        self
    }

    /// Routes `Req` requests to the sender's session, which answers with
    /// a `Resp`.
    #[must_use]
    pub fn on_request<Req, Resp, F>(mut self, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: FnMut(&mut S, &mut ServerContext<'_>, ConnectionId, &Req) -> Resp + 'static,
    {
        if self.requests.claim::<Resp>() {
            self.requests.insert_typed::<Req>(request_fn::<S, Req, Resp, F>(handler));
        }
        self
    }

    /// Returns true if messages or requests with `id` are routed.
    #[must_use]
    pub fn handles(&self, id: MessageId) -> bool {
        self.handlers.contains(id) || self.requests.contains(id)
    }

    /// Number of registered message and request handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len() + self.requests.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: Session> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
