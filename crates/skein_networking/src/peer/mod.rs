//! # Peers
//!
//! [`Server`] and [`Client`] sit on top of a [`WirePeer`](crate::wire::WirePeer)
//! and turn its event stream into typed handler calls.
//!
//! ## Dispatch
//!
//! ```text
//! update()
//!   └─ wire.poll ─> Connected ──> connection table, observers
//!                   Data ──────> [id][payload]
//!                   │              ├─ 0xFF01 request  ─> request handler ─> response
//!                   │              ├─ 0xFF02 response ─> EndPoint
//!                   │              └─ other           ─> message handler
//!                   Disconnected ─> cancel calls, observers
//!   └─ EndPoint::expire
//! ```
//!
//! Handlers only run inside `update()`, on the thread that calls it.
//! Every received buffer goes back to the pool once dispatched.

mod client;
mod context;
mod handlers;
pub mod rpc;
mod server;

pub use client::Client;
pub use context::{ClientContext, ServerContext};
pub use handlers::{message_fn, request_fn, HandlerTable, MessageFn, RequestFn};
pub use server::Server;

use skein_core::codec::{encode_frame_with_limit, Message, MessageId, FRAME_HEADER_SIZE};
use skein_core::{BufferPool, Packet};
use tracing::warn;

use self::rpc::{write_rpc_header, RpcHeader, RPC_HEADER_SIZE};
use crate::connection::{Connection, ConnectionId};

/// Lifecycle of a peer.
///
/// `Uninitialized → Initialized → Listening → Running → Shutdown` for
/// servers; clients pass through `Running` (connecting) to `Connected`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// No wire peer yet.
    #[default]
    Uninitialized,
    /// Wire peer chosen, not started.
    Initialized,
    /// Server started, first update pending.
    Listening,
    /// Server serving, or client connecting.
    Running,
    /// Client connected.
    Connected,
    /// Stopped.
    Shutdown,
}

impl PeerState {
    /// Returns true while the wire is started.
    #[inline]
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Listening | Self::Running | Self::Connected)
    }
}

/// Whether a [`ServerSink`] consumed a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Not for this sink; the server's own handlers get it.
    Unhandled,
    /// Consumed.
    Handled,
    /// Meant for this sink but dropped (malformed, no session).
    Failed,
}

/// Hooks a wrapper gets into a server's `update()`, ahead of the server's
/// own handlers and observers.
pub trait ServerSink {
    /// A connection was accepted.
    fn on_connected(&mut self, _ctx: &mut ServerContext<'_>, _connection: &Connection) {}

    /// A connection closed.
    fn on_disconnected(&mut self, _id: ConnectionId) {}

    /// A message frame arrived.
    fn on_message(
        &mut self,
        _ctx: &mut ServerContext<'_>,
        _id: ConnectionId,
        _message: MessageId,
        _payload: &[u8],
    ) -> Dispatch {
        Dispatch::Unhandled
    }

    /// A request arrived. A handled request appends its response frame to
    /// `out`.
    fn on_request(
        &mut self,
        _ctx: &mut ServerContext<'_>,
        _id: ConnectionId,
        _message: MessageId,
        _payload: &[u8],
        _out: &mut Vec<u8>,
    ) -> Dispatch {
        Dispatch::Unhandled
    }
}

impl ServerSink for () {}

/// Encodes `[id][payload]` into a pooled packet.
pub(crate) fn encode_packet<T: Message>(pool: &BufferPool, message: &T, max_frame_size: usize) -> Option<Packet> {
    let mut buffer = pool.rent(FRAME_HEADER_SIZE + std::mem::size_of::<T>());
    let limit = max_frame_size.saturating_sub(FRAME_HEADER_SIZE);
    match encode_frame_with_limit(message, buffer.as_mut_vec(), limit) {
        Ok(()) => Some(Packet::new(buffer)),
        Err(err) => {
            warn!(id = %T::ID, message = std::any::type_name::<T>(), error = %err, "Failed to encode message");
            pool.give_back(buffer);
            None
        }
    }
}

/// Encodes an RPC frame wrapping `message` into a pooled packet.
pub(crate) fn encode_rpc_packet<T: Message>(
    pool: &BufferPool,
    kind: MessageId,
    header: RpcHeader,
    message: &T,
    max_frame_size: usize,
) -> Option<Packet> {
    let overhead = 2 * FRAME_HEADER_SIZE + RPC_HEADER_SIZE;
    let mut buffer = pool.rent(overhead + std::mem::size_of::<T>());
    write_rpc_header(buffer.as_mut_vec(), kind, header);
    match encode_frame_with_limit(message, buffer.as_mut_vec(), max_frame_size.saturating_sub(overhead)) {
        Ok(()) => Some(Packet::new(buffer)),
        Err(err) => {
            warn!(id = %T::ID, message = std::any::type_name::<T>(), error = %err, "Failed to encode request");
            pool.give_back(buffer);
            None
        }
    }
}
