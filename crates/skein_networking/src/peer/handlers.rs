//! Registration tables mapping message ids to type-erased handlers.
//!
//! Each handler closure owns an [`ObjectPool`] of its message type and
//! decodes into a rented instance, so dispatch never inspects types at
//! runtime and steady-state decoding does not allocate.

use std::collections::HashMap;

use skein_core::codec::{decode_into, encode_frame_with_limit, Message, MessageId, FRAME_HEADER_SIZE};
use skein_core::{MessageRegistry, ObjectPool};
use tracing::warn;

use super::context::ServerContext;
use super::rpc::RPC_HEADER_SIZE;
use crate::connection::ConnectionId;

/// Idle instances kept per message pool.
pub(crate) const MESSAGE_POOL_CAPACITY: usize = 16;

/// Erased message handler. `S` is per-call state owned by the caller
/// (`()` for plain servers, the session for gates).
pub type MessageFn<S> = Box<dyn FnMut(&mut S, &mut ServerContext<'_>, ConnectionId, &[u8]) -> bool>;

/// Erased request handler. Writes the response frame into the buffer.
pub type RequestFn<S> =
    Box<dyn FnMut(&mut S, &mut ServerContext<'_>, ConnectionId, &[u8], &mut Vec<u8>) -> bool>;

/// At most one handler per message id.
///
/// Typed registration also records which type owns each id, so two
/// message types sharing a wire id are caught when the second one is
/// registered instead of being decoded as each other.
pub struct HandlerTable<H> {
    handlers: HashMap<MessageId, (H, &'static str)>,
    owners: MessageRegistry,
}

impl<H> HandlerTable<H> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            owners: MessageRegistry::new(),
        }
    }

    /// Adds the handler for `T`. Refused when `T::ID` is reserved, already
    /// handled, or owned by another type.
    pub fn insert_typed<T: Message>(&mut self, handler: H) -> bool {
        self.claim::<T>() && self.insert(T::ID, std::any::type_name::<T>(), handler)
    }

    /// Records `T` as the owner of `T::ID`. Returns false if the id is
    /// reserved or another type already owns it.
    pub fn claim<T: Message>(&mut self) -> bool {
        match self.owners.register::<T>() {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "Message type refused");
                false
            }
        }
    }

    /// Adds a handler. A second registration for the same id is refused.
    pub fn insert(&mut self, id: MessageId, name: &'static str, handler: H) -> bool {
        if id.is_reserved() {
            warn!(%id, message = name, "Refusing handler for reserved id");
            return false;
        }
        if let Some((_, existing)) = self.handlers.get(&id) {
            warn!(%id, existing, incoming = name, "Handler already registered");
            return false;
        }
        self.handlers.insert(id, (handler, name));
        true
    }

    /// Removes the handler for `id`.
    pub fn remove(&mut self, id: MessageId) -> bool {
        self.handlers.remove(&id).is_some()
    }

    /// Handler for `id`.
    pub fn get_mut(&mut self, id: MessageId) -> Option<&mut H> {
        self.handlers.get_mut(&id).map(|(handler, _)| handler)
    }

    /// Returns true if `id` has a handler.
    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<H> Default for HandlerTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes `payload` into a pooled `T` and runs `f` on it.
///
/// Returns `None` on malformed input.
pub(crate) fn with_decoded<T: Message, R>(
    pool: &ObjectPool<T>,
    payload: &[u8],
    f: impl FnOnce(&T) -> R,
) -> Option<R> {
    let mut message = pool.rent();
    let result = decode_into(payload, &mut *message).then(|| f(&*message));
    pool.give_back(message);
    result
}

/// Appends the response frame to `out` within the frame budget left after
/// the RPC header.
pub(crate) fn encode_response<T: Message>(response: &T, out: &mut Vec<u8>, max_frame_size: usize) -> bool {
    let limit = max_frame_size.saturating_sub(2 * FRAME_HEADER_SIZE + RPC_HEADER_SIZE);
    match encode_frame_with_limit(response, out, limit) {
        Ok(()) => true,
        Err(err) => {
            warn!(message = std::any::type_name::<T>(), error = %err, "Failed to encode response");
            false
        }
    }
}

fn message_fn_bound<S, F>(f: F) -> F
where
    F: FnMut(&mut S, &mut ServerContext<'_>, ConnectionId, &[u8]) -> bool,
{
    f
}

fn request_fn_bound<S, F>(f: F) -> F
where
    F: FnMut(&mut S, &mut ServerContext<'_>, ConnectionId, &[u8], &mut Vec<u8>) -> bool,
{
    f
}

/// Wraps a typed message handler.
pub fn message_fn<S, T, F>(mut handler: F) -> MessageFn<S>
where
    S: 'static,
    T: Message,
    F: FnMut(&mut S, &mut ServerContext<'_>, ConnectionId, &T) + 'static,
{
    let pool = ObjectPool::<T>::new(MESSAGE_POOL_CAPACITY);
    Box::new(message_fn_bound(move |state: &mut S, ctx, id, payload| {
        with_decoded(&pool, payload, |message| handler(state, ctx, id, message)).is_some()
    }))
}

/// Wraps a typed request handler; the response is encoded after the RPC
/// header already in the output buffer.
pub fn request_fn<S, Req, Resp, F>(mut handler: F) -> RequestFn<S>
where
    S: 'static,
    Req: Message,
    Resp: Message,
    F: FnMut(&mut S, &mut ServerContext<'_>, ConnectionId, &Req) -> Resp + 'static,
{
    let pool = ObjectPool::<Req>::new(MESSAGE_POOL_CAPACITY);
    Box::new(request_fn_bound(move |state: &mut S, ctx, id, payload, out| {
        let max_frame_size = ctx.settings().max_frame_size;
        with_decoded(&pool, payload, |request| handler(state, ctx, id, request))
            .is_some_and(|response| encode_response(&response, out, max_frame_size))
    }))
}
